use clap::Parser;
use eyre::eyre;
use std::time::Duration;

use sockunit::address::{Address, SockType};
use sockunit::config::{ExecCommand, ListenDirective, SocketUnitConfig};
use sockunit::options::SocketOptions;
use sockunit::port::MqueueAttrs;

type Result<T> = color_eyre::eyre::Result<T>;

/// A socket-activation unit controller
#[derive(Parser)]
#[command(name = "sockunitd")]
#[command(about = "A socket-activation unit controller")]
#[command(version)]
pub struct Cli {
    /// Unit identity, e.g. "echo.socket"
    #[arg(long)]
    pub identity: String,

    /// A `listen_*` directive value: `host:port`, bare `port`, an absolute
    /// path, or `@name` for an abstract UNIX socket. Repeatable.
    #[arg(long = "listen", required = true)]
    pub listen: Vec<String>,

    /// Socket type for every `--listen` socket directive (non-socket
    /// `--listen` paths ending in a recognized special suffix are ignored).
    #[arg(long, default_value = "stream")]
    pub sock_type: String,

    /// Run in per-connection accept mode instead of shared-service mode
    #[arg(long)]
    pub accept: bool,

    /// Maximum simultaneous connections (accept mode) or concurrent jobs
    /// (shared-service mode)
    #[arg(long, default_value = "64")]
    pub max_connections: u32,

    /// Listen backlog
    #[arg(long, default_value = "128")]
    pub backlog: u32,

    /// Phase timeout, in seconds
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,

    /// Escalate to SIGKILL after the stop-pre-sigterm/final-sigterm timeout
    /// elapses, instead of giving up at SIGTERM
    #[arg(long, default_value = "true")]
    pub send_sigkill: bool,

    /// The service unit to trigger in shared-service mode (required unless
    /// --accept is set)
    #[arg(long)]
    pub service: Option<String>,

    /// A start-pre helper command, given as a single whitespace-separated
    /// string ("program arg1 arg2"). Repeatable, run in order.
    #[arg(long = "exec-start-pre")]
    pub exec_start_pre: Vec<String>,

    /// A start-post helper command. Repeatable, run in order.
    #[arg(long = "exec-start-post")]
    pub exec_start_post: Vec<String>,

    /// A stop-pre helper command. Repeatable, run in order.
    #[arg(long = "exec-stop-pre")]
    pub exec_stop_pre: Vec<String>,

    /// A stop-post helper command. Repeatable, run in order.
    #[arg(long = "exec-stop-post")]
    pub exec_stop_post: Vec<String>,
}

fn parse_exec_command(spec: &str) -> Result<ExecCommand> {
    let mut parts = spec.split_whitespace();
    let path = parts
        .next()
        .ok_or_else(|| eyre!("empty helper command"))?
        .to_string();
    Ok(ExecCommand {
        path,
        args: parts.map(str::to_string).collect(),
    })
}

fn parse_listen_directive(spec: &str, sock_type: SockType) -> Result<ListenDirective> {
    if let Some(path) = spec.strip_prefix("fifo:") {
        return Ok(ListenDirective::Fifo(path.into()));
    }
    if let Some(path) = spec.strip_prefix("special:") {
        return Ok(ListenDirective::Special(path.into()));
    }
    if let Some(path) = spec.strip_prefix("mqueue:") {
        return Ok(ListenDirective::Mqueue(path.into()));
    }
    let address = Address::parse(spec).map_err(|e| eyre!("invalid --listen value '{spec}': {e}"))?;
    Ok(ListenDirective::Socket { address, sock_type })
}

/// Builds a validated configuration from parsed CLI arguments. Fields that
/// the CLI doesn't expose (directory/socket file modes, per-port mqueue
/// attributes, extra options) take the same defaults as
/// [`crate::config::accept_stream_config`]/[`crate::config::shared_service_config`].
///
/// A free function rather than an inherent impl on `SocketUnitConfig`
/// because that type lives in the library crate and this module is compiled
/// into the binary crate.
pub fn build_config(cli: Cli) -> Result<SocketUnitConfig> {
    let sock_type =
        SockType::from_str(&cli.sock_type).ok_or_else(|| eyre!("unrecognized --sock-type '{}'", cli.sock_type))?;

    let listen = cli
        .listen
        .iter()
        .map(|spec| parse_listen_directive(spec, sock_type))
        .collect::<Result<Vec<_>>>()?;

    if !cli.accept && cli.service.is_none() {
        return Err(eyre!("--service is required unless --accept is set"));
    }

    let config = SocketUnitConfig {
        identity: cli.identity,
        listen,
        backlog: cli.backlog,
        directory_mode: 0o755,
        socket_mode: 0o666,
        accept: cli.accept,
        max_connections: cli.max_connections,
        timeout: Duration::from_secs(cli.timeout_secs),
        kill_mode_send_sigkill: cli.send_sigkill,
        mqueue_attrs: MqueueAttrs::default(),
        options: SocketOptions::default(),
        start_pre: cli.exec_start_pre.iter().map(|s| parse_exec_command(s)).collect::<Result<_>>()?,
        start_post: cli.exec_start_post.iter().map(|s| parse_exec_command(s)).collect::<Result<_>>()?,
        stop_pre: cli.exec_stop_pre.iter().map(|s| parse_exec_command(s)).collect::<Result<_>>()?,
        stop_post: cli.exec_stop_post.iter().map(|s| parse_exec_command(s)).collect::<Result<_>>()?,
        shared_service: if cli.accept { None } else { cli.service },
    };

    config.validate().map_err(|e| eyre!(e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli(listen: &str) -> Cli {
        Cli {
            identity: "t.socket".to_string(),
            listen: vec![listen.to_string()],
            sock_type: "stream".to_string(),
            accept: true,
            max_connections: 4,
            backlog: 128,
            timeout_secs: 5,
            send_sigkill: true,
            service: None,
            exec_start_pre: vec![],
            exec_start_post: vec![],
            exec_stop_pre: vec![],
            exec_stop_post: vec![],
        }
    }

    #[test]
    fn builds_a_valid_accept_config_from_minimal_flags() {
        let cli = base_cli("127.0.0.1:0");
        let config = build_config(cli).unwrap();
        assert!(config.accept);
        assert_eq!(config.listen.len(), 1);
    }

    #[test]
    fn shared_service_mode_requires_a_service_flag() {
        let mut cli = base_cli("127.0.0.1:0");
        cli.accept = false;
        let err = build_config(cli).unwrap_err();
        assert!(err.to_string().contains("--service"));
    }

    #[test]
    fn parses_a_multi_argument_helper_command() {
        let cmd = parse_exec_command("/usr/bin/env FOO=bar").unwrap();
        assert_eq!(cmd.path, "/usr/bin/env");
        assert_eq!(cmd.args, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn fifo_listen_directive_is_recognized() {
        let directive = parse_listen_directive("fifo:/run/x.fifo", SockType::Stream).unwrap();
        assert!(matches!(directive, ListenDirective::Fifo(_)));
    }
}
