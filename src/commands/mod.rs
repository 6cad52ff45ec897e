pub mod jobs;
pub mod run;
pub mod topic;
pub mod validate;
