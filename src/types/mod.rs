//! Document value model and its two codecs: the BSON binary layout used on the wire
//! and the JSON projection used for storage.

mod binary;
mod document;
mod json;
mod scalars;
mod value;

pub use binary::{DecodeError, MAX_DEPTH, Scalar};
pub use document::{Document, FieldError};
pub use json::JsonError;
pub use scalars::{Binary, DateTime, ObjectId, Regex, Timestamp};
pub use value::{Value, tag};

/// Builds a [`Document`] from `"key": value` pairs, keeping their order.
#[macro_export]
macro_rules! doc {
    () => {
        $crate::types::Document::new()
    };
    ($($key:literal : $value:expr),+ $(,)?) => {{
        let mut doc = $crate::types::Document::new();
        $(
            doc.insert($key, $value);
        )+
        doc
    }};
}
