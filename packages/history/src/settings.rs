// ABOUTME: History engine settings derived from the lab configuration
// ABOUTME: Commit identity, main branch name and the large-file threshold

use branchlab_config::LabConfig;
use std::path::PathBuf;

pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub home: PathBuf,
    pub main_branch: String,
    pub author: String,
    pub email: String,
    /// Files larger than this go to the artifact store instead of the repository
    pub large_file_bytes: u64,
}

impl HistorySettings {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            home: config.home.clone(),
            main_branch: MAIN_BRANCH.to_string(),
            author: config.commit_author.clone(),
            email: config.commit_email.clone(),
            large_file_bytes: config.large_file_bytes,
        }
    }

    /// Content-addressed artifacts shared by all sessions
    pub fn artifact_root(&self) -> PathBuf {
        self.home.join(".artifacts")
    }
}
