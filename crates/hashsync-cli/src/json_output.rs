//! JSON output structures for the hashsync CLI

use hashsync_engine::PlanSummary;
use hashsync_types::{ChecksumMismatch, Error, PipelineState, RunStats};
use serde::{Deserialize, Serialize};

/// Complete JSON output for one command
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResultJson {
    /// Operation metadata
    pub metadata: OperationMetadata,
    /// Plan as prepared, if preparation succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    /// Run statistics, if the run finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStatsJson>,
    /// Files that failed verification
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mismatches: Vec<MismatchJson>,
    /// Overall result
    pub result: OperationResult,
}

/// Operation metadata
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// hashsync version
    pub version: String,
    /// Command that ran
    pub operation: String,
    /// Timestamp when the output was produced
    pub timestamp: String,
    /// Install root, when known
    pub install_path: Option<String>,
}

/// Run statistics in JSON format
#[derive(Debug, Serialize, Deserialize)]
pub struct RunStatsJson {
    /// Blobs fetched over the network
    pub files_fetched: u64,
    /// Blobs that were already staged
    pub files_already_staged: u64,
    /// Entries satisfied by local content
    pub files_reused: u64,
    /// Files written
    pub files_placed: u64,
    /// Files deleted
    pub files_removed: u64,
    /// Directories renamed
    pub directories_renamed: u64,
    /// Bytes received
    pub bytes_downloaded: u64,
    /// Duration in seconds
    pub duration_seconds: f64,
    /// Average download rate in bytes per second
    pub transfer_rate_bytes_per_sec: f64,
}

impl From<&RunStats> for RunStatsJson {
    fn from(stats: &RunStats) -> Self {
        Self {
            files_fetched: stats.files_fetched,
            files_already_staged: stats.files_already_staged,
            files_reused: stats.files_reused,
            files_placed: stats.files_placed,
            files_removed: stats.files_removed,
            directories_renamed: stats.directories_renamed,
            bytes_downloaded: stats.bytes_downloaded,
            duration_seconds: stats.duration.as_secs_f64(),
            transfer_rate_bytes_per_sec: stats.transfer_rate(),
        }
    }
}

/// One file that failed verification
#[derive(Debug, Serialize, Deserialize)]
pub struct MismatchJson {
    /// Manifest name
    pub name: String,
    /// Expected hash
    pub expected: String,
    /// Actual hash, absent when the file was missing or unreadable
    pub actual: Option<String>,
}

impl From<&ChecksumMismatch> for MismatchJson {
    fn from(mismatch: &ChecksumMismatch) -> Self {
        Self {
            name: mismatch.name.clone(),
            expected: mismatch.expected.to_hex(),
            actual: mismatch.actual.map(|hash| hash.to_hex()),
        }
    }
}

/// Overall operation result
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResult {
    /// Whether the operation was successful
    pub success: bool,
    /// Final pipeline state
    pub state: PipelineState,
    /// Result message
    pub message: String,
    /// Process exit code
    pub exit_code: u8,
}

impl RunResultJson {
    /// Output for `operation`, filled in by the `with_*` setters
    pub fn new(operation: &str, install_path: Option<String>) -> Self {
        Self {
            metadata: OperationMetadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                operation: operation.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                install_path,
            },
            plan: None,
            stats: None,
            mismatches: Vec::new(),
            result: OperationResult {
                success: true,
                state: PipelineState::Idle,
                message: String::new(),
                exit_code: 0,
            },
        }
    }

    /// Attach the prepared plan
    pub fn with_plan(mut self, plan: Option<PlanSummary>) -> Self {
        self.plan = plan;
        self
    }

    /// Attach the outcome of the run
    pub fn with_outcome(mut self, state: PipelineState, outcome: &Result<Option<RunStats>, Error>) -> Self {
        self.result.state = state;
        match outcome {
            Ok(stats) => {
                self.stats = stats.as_ref().map(RunStatsJson::from);
                self.result.message = format!("Completed ({})", state);
            }
            Err(error) => {
                if let Error::ChecksumFailed { files } = error {
                    self.mismatches = files.iter().map(MismatchJson::from).collect();
                }
                self.result.success = false;
                self.result.message = error.to_string();
                self.result.exit_code = crate::exit_code(error);
            }
        }
        self
    }

    /// Print as pretty JSON on stdout
    pub fn print(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashsync_sync::hash_bytes;

    #[test]
    fn test_checksum_failure_lists_files() {
        let error = Error::ChecksumFailed {
            files: vec![ChecksumMismatch {
                name: "a.txt".to_string(),
                expected: hash_bytes(b"a"),
                actual: None,
            }],
        };
        let output = RunResultJson::new("verify", Some("/opt/app".to_string()))
            .with_outcome(PipelineState::Error, &Err(error));

        assert!(!output.result.success);
        assert_eq!(output.result.exit_code, 2);
        assert_eq!(output.mismatches.len(), 1);
        assert_eq!(output.mismatches[0].expected, hash_bytes(b"a").to_hex());

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["result"]["state"], "error");
        assert!(json.get("stats").is_none());
    }

    #[test]
    fn test_success_carries_stats() {
        let stats = RunStats {
            files_placed: 3,
            ..RunStats::default()
        };
        let output = RunResultJson::new("sync", None)
            .with_outcome(PipelineState::Finished, &Ok(Some(stats)));

        assert!(output.result.success);
        assert_eq!(output.stats.as_ref().map(|s| s.files_placed), Some(3));
    }
}
