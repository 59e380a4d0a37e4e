//! The backend contract for registry storage: a narrow put/get/delete
//! interface with no knowledge of digests or reference counts.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
