//! Global command-line options and their validated form.

use std::path::PathBuf;

use clap::Args;
use servermanager::{ServerUrl, SessionConfig};

use crate::CliError;

pub const DEFAULT_TEST_THRESHOLD: f64 = 10.0;

#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// `builtin:`, `cs://host:port` or `csrc://port`.
    #[arg(long, global = true, env = "SM_SERVER_URL")]
    pub server_url: Option<String>,

    #[arg(long, global = true)]
    pub python_script: Option<PathBuf>,

    /// Test script to run; repeat for several.
    #[arg(long = "test-script", global = true)]
    pub test_scripts: Vec<PathBuf>,

    /// Baseline image for the test script in the same position.
    #[arg(long = "baseline", global = true)]
    pub baselines: Vec<PathBuf>,

    /// Image comparison threshold for the test script in the same position.
    #[arg(long = "threshold", global = true)]
    pub thresholds: Vec<f64>,

    #[arg(long, global = true)]
    pub tile_image_dump: Option<PathBuf>,

    #[arg(long = "plugin-path", global = true, env = "SM_PLUGIN_PATH", value_delimiter = ':')]
    pub plugin_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub script: PathBuf,
    pub baseline: Option<PathBuf>,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub server_url: ServerUrl,
    pub python_script: Option<PathBuf>,
    pub tests: Vec<TestCase>,
    pub tile_image_dump: Option<PathBuf>,
    pub plugin_paths: Vec<PathBuf>,
}

impl RunConfig {
    /// Check the global options and pair test scripts with their baselines
    /// and thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::InvalidOption`] for inconsistent test options or a
    /// missing python script, and [`CliError::Sm`] for a bad server url.
    pub fn from_args(args: &GlobalArgs) -> Result<Self, CliError> {
        let server_url = match &args.server_url {
            Some(raw) => raw.parse()?,
            None => ServerUrl::Builtin,
        };

        if let Some(script) = &args.python_script {
            if !script.is_file() {
                return Err(CliError::InvalidOption(format!("python script not found: {}", script.display())));
            }
        }

        if args.baselines.len() > args.test_scripts.len() {
            return Err(CliError::InvalidOption("--baseline given without a matching --test-script".into()));
        }
        if args.thresholds.len() > args.test_scripts.len() {
            return Err(CliError::InvalidOption("--threshold given without a matching --test-script".into()));
        }
        if let Some(bad) = args.thresholds.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(CliError::InvalidOption(format!("threshold must be a non-negative number, got {bad}")));
        }

        let tests = args
            .test_scripts
            .iter()
            .enumerate()
            .map(|(i, script)| TestCase {
                script: script.clone(),
                baseline: args.baselines.get(i).cloned(),
                threshold: args.thresholds.get(i).copied().unwrap_or(DEFAULT_TEST_THRESHOLD),
            })
            .collect();

        Ok(Self {
            server_url,
            python_script: args.python_script.clone(),
            tests,
            tile_image_dump: args.tile_image_dump.clone(),
            plugin_paths: args.plugin_paths.clone(),
        })
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server_url.clone(),
            plugin_paths: self.plugin_paths.clone(),
            ..SessionConfig::default()
        }
    }

    pub fn log(&self) {
        tracing::info!(
            server_url = %self.server_url,
            python_script = ?self.python_script,
            tests = self.tests.len(),
            tile_image_dump = ?self.tile_image_dump,
            plugin_paths = self.plugin_paths.len(),
            "cli: run configuration"
        );
        for test in &self.tests {
            tracing::debug!(script = %test.script.display(), baseline = ?test.baseline, threshold = test.threshold, "cli: test");
        }
    }
}

#[cfg(test)]
#[path = "run_config_test.rs"]
mod tests;
