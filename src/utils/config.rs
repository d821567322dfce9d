//! Configuration parameters struct parsing helper.

/// Builds a configuration struct by starting from its `Default` and applying
/// overrides parsed from an optional TOML string. Only the listed field
/// names may be overridden; any other key in the string is an error, as is a
/// value of the wrong type. Returns `Ok(config)` or `Err(TsoError)`.
///
/// Example:
/// ```no_run
/// let config = parsed_config!(config_str => TsoConfig;
///                             ctrol_heart_beat_interval_ms,
///                             enable_tx_checksum)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        let compose = || -> Result<$config_type, TsoError> {
            let mut config: $config_type = Default::default();
            let Some(overrides) = config_str else {
                return Ok(config);
            };
            let mut table = overrides.parse::<toml::Table>()?;

            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+

            // anything still in the table was not named above
            if let Some(key) = table.keys().next() {
                return Err(TsoError::msg(format!(
                    "unrecognized config key '{}'",
                    key
                )));
            }

            Ok(config)
        };

        compose()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::TsoError;

    /// Stand-in for a batch-window config fragment.
    #[derive(Debug, PartialEq)]
    struct BatchWindow {
        win_size_ms: u64,
        transport: String,
        max_drift_ppm: f64,
    }

    impl Default for BatchWindow {
        fn default() -> Self {
            BatchWindow {
                win_size_ms: 8,
                transport: "rrdma".into(),
                max_drift_ppm: 0.2,
            }
        }
    }

    #[test]
    fn no_string_keeps_defaults() -> Result<(), TsoError> {
        let window = parsed_config!(None => BatchWindow;
                                    win_size_ms, transport, max_drift_ppm)?;
        assert_eq!(window, BatchWindow::default());
        Ok(())
    }

    #[test]
    fn overrides_touch_only_given_keys() -> Result<(), TsoError> {
        let config_str =
            Some("win_size_ms = 4\ntransport = 'tcp+k2rpc'");
        let window = parsed_config!(config_str => BatchWindow;
                                    win_size_ms, transport, max_drift_ppm)?;
        assert_eq!(window.win_size_ms, 4);
        assert_eq!(window.transport, "tcp+k2rpc");
        assert_eq!(window.max_drift_ppm, 0.2);
        Ok(())
    }

    #[test]
    fn unrecognized_key_is_rejected() {
        let config_str = Some("lease_ms = 30");
        assert!(
            parsed_config!(config_str => BatchWindow; win_size_ms).is_err()
        );
    }

    #[test]
    fn mistyped_value_is_rejected() {
        let config_str = Some("win_size_ms = 'quick'");
        assert!(
            parsed_config!(config_str => BatchWindow; win_size_ms).is_err()
        );
    }
}
