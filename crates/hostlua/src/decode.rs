// Table-to-record decoding driven by host code

use crate::engine::ScriptEngine;
use crate::error::BridgeResult;

/// A host type that fills itself from a script table.
///
/// `decode_table` is called with the table at the top of the engine stack
/// (index `-1`). It may push and pop freely; the bridge restores the stack
/// height afterwards, whether decoding succeeded or not.
///
/// ```ignore
/// impl TableDecoder for Settings {
///     fn decode_table(&mut self, engine: &ScriptEngine) -> BridgeResult<()> {
///         engine.get_field(-1, "title")?;
///         self.title = engine.to_string(-1).unwrap_or_default();
///         engine.pop(1);
///         Ok(())
///     }
/// }
/// ```
pub trait TableDecoder {
    fn decode_table(&mut self, engine: &ScriptEngine) -> BridgeResult<()>;
}
