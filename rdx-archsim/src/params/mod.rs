//! Typed parameters, their string grammar and the text serializer.

mod parameter;
pub mod serialize;
mod value;

pub use parameter::{Parameter, ParameterDef, ParameterSet, Validator};
pub use value::{DisplayBase, ParamConvert, ParamType, ParamValue};
