//! Challenge sources - static lists, target files and the platform API
//!
//! Every source yields normalized [`ChallengeItem`]s:
//! - a single URL or a fixed list (`StaticSource`)
//! - a text file with one URL per line (`TargetsFile`)
//! - the competition platform's challenge listing (`PlatformClient`)
//!
//! [`ChallengeItem`]: flagrun_common::ChallengeItem

mod file;
mod normalize;
mod platform;

pub use file::{code_for_url, items_from_urls, parse_targets, StaticSource, TargetsFile};
pub use normalize::{difficulty_rank, normalize_challenges, ChallengeStats, Normalized};
pub use platform::{hint_content, PlatformClient, PlatformConfig};
