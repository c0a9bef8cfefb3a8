use std::collections::HashMap;

/// A type-safe wrapper for environment variables that provides clear semantics
/// for building and composing environment variable sets.
///
/// This type uses a `set` method instead of `insert` to emphasize the intent
/// of setting environment variables, making the code more readable and
/// self-documenting.
#[derive(Debug, Clone, Default)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates a new empty environment variable set.
    ///
    /// # Returns
    /// * `Self` - A new empty Environment instance
    pub fn new() -> Self {
        Self(HashMap::new())
    }
    
    /// Sets an environment variable in this environment set.
    ///
    /// This method uses the name `set` instead of `insert` to make the intent
    /// clear and provide better semantic meaning for environment variable operations.
    ///
    /// # Arguments
    /// * `key` - The environment variable name
    /// * `value` - The environment variable value
    ///
    /// # Examples
    /// ```
    /// use sockunit::Environment;
    /// 
    /// let mut env = Environment::new();
    /// env.set("PATH", "/usr/bin");
    /// env.set("HOME", "/home/user");
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
    
    /// Extends this environment with variables from another environment.
    ///
    /// Variables in the `other` environment will overwrite variables with
    /// the same name in this environment.
    ///
    /// # Arguments
    /// * `other` - The environment to merge into this one
    ///
    /// # Examples
    /// ```
    /// use sockunit::Environment;
    /// 
    /// let mut base_env = Environment::new();
    /// base_env.set("PATH", "/usr/bin");
    /// 
    /// let mut additional_env = Environment::new();
    /// additional_env.set("HOME", "/home/user");
    /// 
    /// base_env.extend(additional_env);
    /// ```
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }
    
    /// Consumes this Environment and returns the underlying HashMap.
    ///
    /// This method is useful when you need to pass the environment variables
    /// to APIs that expect a HashMap directly.
    ///
    /// # Returns
    /// * `HashMap<String, String>` - The underlying environment variable map
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
    
    /// Gets the value of an environment variable.
    ///
    /// # Arguments
    /// * `key` - The environment variable name to look up
    ///
    /// # Returns
    /// * `Option<&String>` - The environment variable value, if present
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    /// Returns true if the environment contains no variables.
    ///
    /// # Returns
    /// * `bool` - True if empty, false otherwise
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of environment variables.
    ///
    /// # Returns
    /// * `usize` - The number of environment variables
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<HashMap<String, String>> for Environment {
    /// Creates an Environment from a HashMap of strings.
    ///
    /// # Arguments
    /// * `map` - The HashMap to convert
    ///
    /// # Returns
    /// * `Self` - The Environment instance
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}
