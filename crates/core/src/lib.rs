//! Core verdict types - classification, errors, options, hashing.
//! No networking, no async dependencies.

pub mod config;
pub mod error;
pub mod sha256;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::Options;
pub use error::{Result, UploadError, VerdictError};
pub use sha256::Sha256;

/// Classification issued by the verdict service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Clean,
    Malicious,
    Pup,
    /// The service has not seen the sample; a file can be uploaded for analysis.
    Unknown,
}

impl Verdict {
    #[must_use]
    pub const fn is_malicious(&self) -> bool {
        matches!(self, Self::Malicious)
    }

    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "Clean",
            Self::Malicious => "Malicious",
            Self::Pup => "Pup",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a verdict request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanVerdict {
    /// Digest the verdict applies to. For URL requests the service computes it.
    pub sha256: String,
    pub verdict: Verdict,
    /// Name of the detection, when the service reports one.
    pub detection: Option<String>,
}

impl fmt::Display for ScanVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detection {
            Some(detection) => write!(f, "{} ({detection})", self.verdict),
            None => write!(f, "{}", self.verdict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_predicates() {
        assert!(Verdict::Malicious.is_malicious());
        assert!(!Verdict::Pup.is_malicious());
        assert!(Verdict::Unknown.is_unknown());
        assert!(!Verdict::Clean.is_unknown());
    }

    #[test]
    fn scan_verdict_display_includes_detection() {
        let v = ScanVerdict {
            sha256: "00".into(),
            verdict: Verdict::Malicious,
            detection: Some("EICAR-Test-File".into()),
        };
        assert_eq!(v.to_string(), "Malicious (EICAR-Test-File)");

        let v = ScanVerdict {
            detection: None,
            verdict: Verdict::Clean,
            ..v
        };
        assert_eq!(v.to_string(), "Clean");
    }
}
