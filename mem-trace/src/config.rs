use std::path::PathBuf;
use std::str::FromStr;

use crate::discovery::MarkerNames;
use crate::gate::GateState;
use crate::instrument::RecordMode;
use crate::TraceError;

pub const DEFAULT_OUTPUT: &str = "memtrace.out";
pub const DEFAULT_BUFFER_PAGES: usize = 1024;

/// Settings for a capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the trace file.
    pub output: PathBuf,
    /// Size of the capture buffer in OS pages.
    pub buffer_pages: usize,
    /// Gate state before any marker has been crossed.
    pub initial_gate: GateState,
    /// End the trace at the first ROI exit instead of at process exit.
    pub roi_only: bool,
    pub record_mode: RecordMode,
    pub markers: MarkerNames,
    /// ELF image searched for the marker routines.
    pub image: Option<PathBuf>,
    /// Load bias added to symbol addresses from `image`. Derived from the guest's entry point
    /// when unset.
    pub image_bias: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            buffer_pages: DEFAULT_BUFFER_PAGES,
            initial_gate: GateState::Enabled,
            roi_only: false,
            record_mode: RecordMode::default(),
            markers: MarkerNames::default(),
            image: None,
            image_bias: None,
        }
    }
}

impl Config {
    /// Builds a configuration from `key=value` arguments.
    ///
    /// Recognized keys are `output`, `pages`, `gate`, `roi_only`, `mode`, `roi_begin`,
    /// `roi_end`, `image` and `image_bias`. Arguments without a value and unknown keys are
    /// skipped with a warning; values that do not parse are errors.
    pub fn from_args<'a, I>(args: I) -> Result<Self, TraceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut config = Self::default();

        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                tracing::warn!(arg = arg, "skipping argument with no value (missing '=')");
                continue;
            };

            match key {
                "output" => config.output = PathBuf::from(value),
                "pages" => config.buffer_pages = parse(key, value)?,
                "gate" => config.initial_gate = parse(key, value)?,
                "roi_only" => config.roi_only = parse_bool(key, value)?,
                "mode" => config.record_mode = parse(key, value)?,
                "roi_begin" => config.markers.begin = String::from(value),
                "roi_end" => config.markers.end = String::from(value),
                "image" => config.image = Some(PathBuf::from(value)),
                "image_bias" => config.image_bias = Some(parse_address(key, value)?),
                _ => {
                    tracing::warn!(arg = key, "skipping unknown argument");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        if self.buffer_pages == 0 {
            return Err(TraceError::Config(String::from(
                "pages: buffer must span at least one page",
            )));
        }
        if self.output.as_os_str().is_empty() {
            return Err(TraceError::Config(String::from("output: path is empty")));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, TraceError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| TraceError::Config(format!("{key}: {err}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, TraceError> {
    match value {
        "on" | "1" | "true" | "yes" => Ok(true),
        "off" | "0" | "false" | "no" => Ok(false),
        other => Err(TraceError::Config(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

fn parse_address(key: &str, value: &str) -> Result<u64, TraceError> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| TraceError::Config(format!("{key}: {err}")))
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_args(std::iter::empty()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.output, PathBuf::from("memtrace.out"));
        assert_eq!(config.buffer_pages, 1024);
    }

    #[test]
    fn test_parse_all_keys() {
        let config = Config::from_args([
            "output=/tmp/roi.trace",
            "pages=16",
            "gate=disabled",
            "roi_only=on",
            "mode=all",
            "roi_begin=roi_begin",
            "roi_end=roi_end",
            "image=/bin/true",
            "image_bias=0x555555554000",
        ])
        .unwrap();

        assert_eq!(config.output, PathBuf::from("/tmp/roi.trace"));
        assert_eq!(config.buffer_pages, 16);
        assert_eq!(config.initial_gate, GateState::Disabled);
        assert!(config.roi_only);
        assert_eq!(config.record_mode, RecordMode::AllInstructions);
        assert_eq!(config.markers.begin, "roi_begin");
        assert_eq!(config.markers.end, "roi_end");
        assert_eq!(config.image, Some(PathBuf::from("/bin/true")));
        assert_eq!(config.image_bias, Some(0x5555_5555_4000));
    }

    #[test]
    fn test_unknown_and_malformed_are_skipped() {
        let config = Config::from_args(["verbose", "colour=blue", "pages=2"]).unwrap();
        assert_eq!(config.buffer_pages, 2);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(matches!(
            Config::from_args(["pages=lots"]),
            Err(TraceError::Config(_))
        ));
        assert!(matches!(
            Config::from_args(["pages=0"]),
            Err(TraceError::Config(_))
        ));
        assert!(matches!(
            Config::from_args(["roi_only=perhaps"]),
            Err(TraceError::Config(_))
        ));
        assert!(matches!(
            Config::from_args(["output="]),
            Err(TraceError::Config(_))
        ));
    }
}
