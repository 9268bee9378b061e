pub mod error;
pub mod evaluator;
pub mod grid;
pub mod logging;
pub mod meta;
pub mod package;
pub mod pipeline;
pub mod scm;
pub mod selection;
pub mod validation;
