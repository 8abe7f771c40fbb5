//! Message schemas for the port dispatch table

mod builtin;
mod table;

pub use table::{
    FieldSchema, FieldType, MessageSchema, PortTable, TableStats, DEFAULT_MEASUREMENT,
};
