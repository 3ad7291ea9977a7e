mod dispatch;
mod filter;
mod rules;
mod session;
mod spool;
mod uploader;

pub use filter::{FilterRules, IptablesTable};
pub use rules::{RuleCache, reapply_cached_rules, run_rule_applier};
pub use session::Session;
pub use spool::{SpoolDirs, run_spool_writer};
pub use uploader::run_upload_loop;
