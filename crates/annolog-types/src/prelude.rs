pub use crate::doc::{DocKind, DocName};
pub use crate::error::{AlResult, Error};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
