//! Job log failure analysis.
//!
//! Classify a failed job's log into a known failure mode and provide a
//! pointer to the full log.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FailureError {
    #[error("Invalid pattern for {error_type}: {source}")]
    InvalidPattern {
        error_type: String,
        #[source]
        source: regex::Error,
    },
}

/// Failure mode classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMode {
    /// Input download ran out of disk
    NoSpaceForInput,
    /// Container image layers could not be unpacked
    NoSpaceForContainer,
    /// Any other write hitting a full disk
    NoSpace,
    /// Workflow rejected its inputs
    MissingWorkflowInput,
    /// Caller-registered pattern
    Custom { error_type: String },
}

impl FailureMode {
    pub fn label(&self) -> &str {
        match self {
            Self::NoSpaceForInput => "Not enough space for input files",
            Self::NoSpaceForContainer => "No space for docker",
            Self::NoSpace => "Not enough space",
            Self::MissingWorkflowInput => "CWL missing input",
            Self::Custom { error_type } => error_type,
        }
    }
}

/// Custom error pattern supplied with a run (`args.custom_errors`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPattern {
    pub error_type: String,
    pub pattern: String,
    #[serde(default)]
    pub multiline: bool,
}

/// Detailed failure analysis result.
#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    /// Classified failure mode
    pub mode: FailureMode,
    /// Log excerpt that matched
    pub matched: String,
    /// Human-readable explanation
    pub explanation: String,
    /// Where to look next
    pub suggestion: String,
}

impl FailureAnalysis {
    fn new(mode: FailureMode, matched: &str) -> Self {
        let (explanation, suggestion) = Self::generate_messages(&mode, matched);
        Self {
            mode,
            matched: matched.to_string(),
            explanation,
            suggestion,
        }
    }

    /// Generate explanation and suggestion based on failure mode.
    fn generate_messages(mode: &FailureMode, matched: &str) -> (String, String) {
        let explanation = format!("{}: {}", mode.label(), matched.trim());
        let suggestion = match mode {
            FailureMode::NoSpaceForInput | FailureMode::NoSpace => {
                "Increase the data volume size of the run.".to_string()
            }
            FailureMode::NoSpaceForContainer => {
                "Increase the root volume size of the run.".to_string()
            }
            FailureMode::MissingWorkflowInput => {
                "Add the missing input to the run's input files or parameters.".to_string()
            }
            FailureMode::Custom { .. } => "Check the job log for details.".to_string(),
        };
        (explanation, suggestion)
    }
}

struct Matcher {
    mode: FailureMode,
    regex: Regex,
}

static BUILT_IN: Lazy<Vec<Matcher>> = Lazy::new(|| {
    [
        (
            FailureMode::NoSpaceForInput,
            r"download failed: .+ No space left on device",
        ),
        (
            FailureMode::NoSpaceForContainer,
            r"failed to register layer.+no space left on device",
        ),
        (FailureMode::NoSpace, r".+No space left on device"),
        (
            FailureMode::MissingWorkflowInput,
            r"Missing required input parameter\s+\S.*",
        ),
    ]
    .into_iter()
    .filter_map(|(mode, pattern)| {
        Regex::new(pattern)
            .map(|regex| Matcher { mode, regex })
            .ok()
    })
    .collect()
});

/// Hint pointing at the full job log.
pub fn check_log_hint(job_id: &str) -> String {
    format!("check log using nimbus log --job-id={}", job_id)
}

/// Message used when no pattern matches a failed job's log.
pub fn general_error_message(job_id: &str) -> String {
    format!("Job encountered an error {}", check_log_hint(job_id))
}

/// Ordered log classifier. Custom patterns are tried after the built-ins.
#[derive(Default)]
pub struct FailureClassifier {
    custom: Vec<Matcher>,
}

impl FailureClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_custom(&mut self, pattern: &CustomPattern) -> Result<(), FailureError> {
        let regex = RegexBuilder::new(&pattern.pattern)
            .multi_line(pattern.multiline)
            .build()
            .map_err(|source| FailureError::InvalidPattern {
                error_type: pattern.error_type.clone(),
                source,
            })?;
        self.custom.push(Matcher {
            mode: FailureMode::Custom {
                error_type: pattern.error_type.clone(),
            },
            regex,
        });
        Ok(())
    }

    /// Add every valid pattern, logging the invalid ones.
    pub fn with_custom(mut self, patterns: &[CustomPattern]) -> Self {
        for pattern in patterns {
            if let Err(e) = self.add_custom(pattern) {
                tracing::warn!("Failed to register custom error pattern: {}", e);
            }
        }
        self
    }

    pub fn pattern_count(&self) -> usize {
        BUILT_IN.len() + self.custom.len()
    }

    /// First matching failure mode, if any.
    pub fn parse_log(&self, log: &str) -> Option<FailureAnalysis> {
        BUILT_IN
            .iter()
            .chain(self.custom.iter())
            .find_map(|matcher| {
                matcher
                    .regex
                    .find(log)
                    .map(|m| FailureAnalysis::new(matcher.mode.clone(), m.as_str()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            general_error_message("somejobid"),
            "Job encountered an error check log using nimbus log --job-id=somejobid"
        );
        assert_eq!(
            check_log_hint("somejobid"),
            "check log using nimbus log --job-id=somejobid"
        );
    }

    #[test]
    fn test_not_enough_space_for_input() {
        let log = "sometext some text some other text \
                   download failed: s3://somebucket/somefile to ../../data1/input/somefile \
                   [Errno 28] No space left on device \
                   some other text some other text";
        let analysis = FailureClassifier::new().parse_log(log).unwrap();
        assert_eq!(analysis.mode, FailureMode::NoSpaceForInput);
        assert!(analysis.explanation.contains("Not enough space for input files"));
    }

    #[test]
    fn test_no_space_for_docker() {
        let log = "failed to register layer: Error processing tar file(exit status 1): \
                   write /miniconda3/pkgs/python-3.7.6-h0371630_2.tar.bz2: no space left on device\
                   some text some text";
        let analysis = FailureClassifier::new().parse_log(log).unwrap();
        assert_eq!(analysis.mode, FailureMode::NoSpaceForContainer);
        assert!(analysis.explanation.contains("No space for docker"));
        assert!(analysis.explanation.contains("tar.bz2: no space left"));
    }

    #[test]
    fn test_no_space() {
        let log = "[fputs] No space left on devicesome text some text";
        let analysis = FailureClassifier::new().parse_log(log).unwrap();
        assert_eq!(analysis.mode, FailureMode::NoSpace);
        assert!(analysis.explanation.contains("Not enough space"));
        assert!(analysis.explanation.contains("[fputs]"));
    }

    #[test]
    fn test_missing_workflow_input() {
        let log = "Workflow error, try again with --debug for more information:\n\
                   Invalid job input record:\n\
                   workflow_gatk.cwl:28:5: Missing required input parameter\n\
                   \x20                                     'chromosomes'\n\
                   some text some text";
        let analysis = FailureClassifier::new().parse_log(log).unwrap();
        assert_eq!(analysis.mode, FailureMode::MissingWorkflowInput);
        assert!(analysis.explanation.contains("CWL missing input"));
        assert!(analysis.explanation.contains("chromosomes"));
    }

    #[test]
    fn test_custom_patterns() {
        let classifier = FailureClassifier::new().with_custom(&[CustomPattern {
            error_type: "Unmatching pairs in fastq".to_string(),
            pattern: "paired reads have different names: .+".to_string(),
            multiline: false,
        }]);
        assert_eq!(classifier.pattern_count(), FailureClassifier::new().pattern_count() + 1);

        let log = "[M::mem_pestat] low and high boundaries for proper pairs: (1, 22)\
                   [mem_sam_pe] paired reads have different names: \
                   \"H3MVTCCXX:4:1101:1174861:0\", \"H3MVTCCXX:4:1101:743397:0\"";
        let analysis = classifier.parse_log(log).unwrap();
        assert!(analysis.explanation.contains("Unmatching pairs in fastq"));
        assert!(analysis.explanation.contains("H3MVTCCXX:4:1101:1174861:0"));
    }

    #[test]
    fn test_custom_pattern_with_group() {
        let patterns: Vec<CustomPattern> = serde_json::from_str(
            r#"[{"error_type": "No peak called",
                 "pattern": "Exception: File is empty (.+.regionPeak.gz)"}]"#,
        )
        .unwrap();
        let classifier = FailureClassifier::new().with_custom(&patterns);
        let log = "sometext some text some other text \
                   Exception: File is empty (1234567890abcdefg.regionPeak.gz) some other text";
        let analysis = classifier.parse_log(log).unwrap();
        assert!(analysis.explanation.contains("No peak called"));
        assert!(analysis.explanation.contains("1234567890abcdefg.regionPeak.gz"));
    }

    #[test]
    fn test_invalid_custom_pattern_is_skipped() {
        let classifier = FailureClassifier::new().with_custom(&[CustomPattern {
            error_type: "broken".to_string(),
            pattern: "(unclosed".to_string(),
            multiline: false,
        }]);
        assert_eq!(classifier.pattern_count(), FailureClassifier::new().pattern_count());
    }

    #[test]
    fn test_no_matching_error() {
        let log = "some text some text no error just some text";
        assert!(FailureClassifier::new().parse_log(log).is_none());
    }
}
