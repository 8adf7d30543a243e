//! Image reference utilities: repo/tag parsing, tag translation, reference
//! replacement and pushing image tarballs.

pub mod pusher;
pub mod replace;
pub mod repotag;
pub mod tags;

pub use pusher::{PushError, Pusher};
pub use replace::{replace_references, replace_references_for_aliases, ReplaceError};
pub use repotag::RepoTag;
pub use tags::{load_repo_tags, most_granular_tag, translate_tags};
