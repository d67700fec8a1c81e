//! Error reporting for CLI commands.
//!
//! Every failure is reported as a single line on stderr.

use strata_common::constants::BIN_NAME;
use strata_common::error::EngineError;

/// Formats an engine error as the one line shown to the user.
#[must_use]
pub fn error_line(error: &EngineError) -> String {
    format!("{BIN_NAME}: {} error: {error}", error.class())
}

/// Formats a front-end error, flattening its cause chain onto one line.
#[must_use]
pub fn anyhow_line(error: &anyhow::Error) -> String {
    let chain: Vec<String> = error.chain().map(ToString::to_string).collect();
    format!("{BIN_NAME}: error: {}", chain.join(": "))
}

/// Prints an engine error.
#[allow(clippy::print_stderr)]
pub fn report_engine_error(error: &EngineError) {
    eprintln!("{}", error_line(error));
}

/// Prints a front-end error.
#[allow(clippy::print_stderr)]
pub fn report_error(error: &anyhow::Error) {
    eprintln!("{}", anyhow_line(error));
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn engine_error_line_names_the_class() {
        let line = error_line(&EngineError::AppNotFound {
            name: "fakeapp".into(),
        });
        assert!(line.starts_with("strata: configuration error:"));
        assert!(line.contains("fakeapp"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn anyhow_line_flattens_context() {
        let error = anyhow::Error::new(EngineError::ImageNotFound {
            path: PathBuf::from("/images/missing"),
        })
        .context("invalid request");
        let line = anyhow_line(&error);
        assert!(line.starts_with("strata: error: invalid request: "));
        assert!(line.contains("/images/missing"));
    }
}
