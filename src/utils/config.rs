//! Tunables struct parsing helper.

/// Composes a tunables struct from its default values, then overwrites given
/// fields by parsing from given TOML string if it's not `None`. Returns an
/// `Ok(config)` on success, and `Err(SkiffError)` on parser failure or on
/// unrecognized field names.
///
/// Example:
/// ```no_run
/// use skiff::parsed_config;
/// use skiff::server::ServerConfig;
///
/// # fn main() -> skiff::utils::Result<()> {
/// let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => ServerConfig; election_timeout)?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> $crate::utils::Result<$config_type> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()
                .map_err(|e| $crate::utils::SkiffError::Invalid(e.to_string()))?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()
                        .map_err(|e: toml::de::Error| {
                            $crate::utils::SkiffError::Invalid(e.to_string())
                        })?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err($crate::utils::SkiffError::Invalid(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::{Result, SkiffError};

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        abc: u64,
        hij: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                abc: 7,
                hij: "skiff".into(),
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<()> {
        let config = parsed_config!(None => TestConfig; abc, hij)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<()> {
        let config_str = Some("hij = 'nice'");
        let config = parsed_config!(config_str => TestConfig; abc, hij)?;
        let ref_config = TestConfig {
            abc: 7,
            hij: "nice".into(),
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        let parsed: Result<TestConfig> =
            parsed_config!(config_str => TestConfig; abc, hij);
        assert!(matches!(parsed, Err(SkiffError::Invalid(_))));
    }
}
