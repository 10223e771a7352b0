use std::env;
use std::num::NonZeroUsize;

use crate::Error;
use crate::Result;

const ENV_POOL_NAME: &str = "FAILFAST_POOL_NAME";
const ENV_POOL_CAPACITY: &str = "FAILFAST_POOL_CAPACITY";

const DEFAULT_POOL_NAME: &str = "default";
const DEFAULT_POOL_CAPACITY: NonZeroUsize = NonZeroUsize::new(10).expect("10 is non-zero");

/// Settings for a [crate::WorkPool].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Name attached to the pool's log events.
    pub name: String,
    /// Maximum number of tasks running at once.
    pub capacity: NonZeroUsize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: DEFAULT_POOL_NAME.to_string(),
            capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Loads the configuration from the `FAILFAST_*` environment variables, unset variables keep
    /// their defaults.
    pub fn from_env() -> Result<Self> {
        Self::load(|key| env::var(key).ok())
    }

    /// Same as [PoolConfig::from_env] but reads the variables through `lookup`.
    pub fn load<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = PoolConfig::default();

        if let Some(name) = lookup(ENV_POOL_NAME) {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Config(format!("{ENV_POOL_NAME} must not be empty")));
            }
            config.name = name.to_string();
        }

        if let Some(capacity) = lookup(ENV_POOL_CAPACITY) {
            config.capacity = capacity.trim().parse::<NonZeroUsize>().map_err(|e| {
                Error::Config(format!(
                    "invalid {ENV_POOL_CAPACITY} value {capacity:?}, expected a positive integer: {e}"
                ))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = PoolConfig::load(lookup_from(&[])).unwrap();
        assert_eq!(config, PoolConfig::default());
        assert_eq!(config.name, "default");
        assert_eq!(config.capacity.get(), 10);
    }

    #[test]
    fn reads_name_and_capacity() {
        let config = PoolConfig::load(lookup_from(&[
            (ENV_POOL_NAME, "ingest"),
            (ENV_POOL_CAPACITY, " 4 "),
        ]))
        .unwrap();
        assert_eq!(config.name, "ingest");
        assert_eq!(config.capacity.get(), 4);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = PoolConfig::load(lookup_from(&[(ENV_POOL_CAPACITY, "0")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn garbage_capacity_is_rejected() {
        let result = PoolConfig::load(lookup_from(&[(ENV_POOL_CAPACITY, "lots")]));
        let Err(Error::Config(msg)) = &result else {
            panic!("expected a config error, got {result:?}");
        };
        assert!(msg.contains(ENV_POOL_CAPACITY));
    }

    #[test]
    fn blank_name_is_rejected() {
        let result = PoolConfig::load(lookup_from(&[(ENV_POOL_NAME, "  ")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
