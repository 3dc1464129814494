//! Engine options, mostly environment-derived.

use crate::event::ToolKind;
use chrono::offset::Local;
use std::path::PathBuf;

/// `APP_NAME`: prefix for the per-run output subdirectory.
pub const ENV_APP_NAME: &str = "APP_NAME";
/// `SAMPLE_RATE`: passed through to the instrumentation layer.
pub const ENV_SAMPLE_RATE: &str = "SAMPLE_RATE";
/// `MAX_NUM_KERNEL_MONITORED`: kernels to analyze before the process
/// self-terminates.
pub const ENV_MAX_KERNELS: &str = "MAX_NUM_KERNEL_MONITORED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub tool: ToolKind,
    pub app_name: Option<String>,
    /// Forwarded to the instrumentation layer; no effect on the analysis.
    pub sample_rate: u32,
    /// Convenience stop after this many kernels.
    pub max_kernels: Option<u64>,
    pub num_threads: usize,
    /// Parent of the timestamped per-run output directory.
    pub output_root: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tool: ToolKind::default(),
            app_name: None,
            sample_rate: 1,
            max_kernels: None,
            num_threads: num_cpus::get_physical(),
            output_root: PathBuf::from("."),
        }
    }
}

impl Options {
    /// Build options from the environment, falling back to defaults for
    /// anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let app_name = std::env::var(ENV_APP_NAME).ok().filter(|s| !s.is_empty());

        let sample_rate = parse_env(ENV_SAMPLE_RATE).unwrap_or(1);
        if sample_rate != 1 {
            log::info!("sample rate set to {sample_rate}");
        }

        let max_kernels = parse_env(ENV_MAX_KERNELS);
        let num_threads = crate::pool::get_num_threads().unwrap_or_else(|err| {
            log::warn!("invalid NUM_THREADS ({err}), falling back to physical core count");
            num_cpus::get_physical()
        });

        Self {
            app_name,
            sample_rate,
            max_kernels,
            num_threads,
            ..Self::default()
        }
    }

    /// Name of the per-run output directory,
    /// `dependency[_<app name>]_<yyyyMMdd-HHmmss>`.
    #[must_use]
    pub fn output_directory_name(&self) -> String {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        match &self.app_name {
            Some(app_name) => format!("dependency_{app_name}_{timestamp}"),
            None => format!("dependency_{timestamp}"),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("ignoring {name}={raw}: {err}");
            None
        }
    }
}
