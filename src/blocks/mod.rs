//! Reference blocks shipped with the engine

pub mod console;
pub mod file;
pub mod null;
pub mod test_pattern;

use std::sync::Arc;

use crate::block::Block;
use crate::registry::BlockRegistry;

pub use self::console::{console_sink, ConsoleReport};
pub use self::file::{file_sink, FileFormat, FileWriter};
pub use self::null::{null_sink, Discard};
pub use self::test_pattern::{test_pattern_source, Pattern, TestPattern};

/// Register every built-in block type under its type name.
pub fn register_builtin(registry: &BlockRegistry) {
    registry.register(test_pattern::TYPE_NAME, || {
        Ok(Arc::new(test_pattern_source()) as Arc<dyn Block>)
    });
    registry.register(console::TYPE_NAME, || {
        Ok(Arc::new(console_sink()) as Arc<dyn Block>)
    });
    registry.register(null::TYPE_NAME, || Ok(Arc::new(null_sink()) as Arc<dyn Block>));
    registry.register(file::TYPE_NAME, || Ok(Arc::new(file_sink()) as Arc<dyn Block>));
}
