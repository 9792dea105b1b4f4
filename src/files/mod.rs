//! File records: listing, creation, edits and subtree removal.

pub mod listing;
pub mod mutation;
pub mod removal;
pub mod view;

pub use listing::{find_all, FieldFilter, FileFilters, ParentScope};
pub use mutation::{create, find_one, update, CreateFile, FilePatch};
pub use removal::{remove, RemoveOutcome};
pub use view::FileView;
