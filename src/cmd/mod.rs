//! CLI command implementations.
//!
//! | Module  | Commands handled |
//! |---------|------------------|
//! | `serve` | `Serve`          |
//! | `rules` | `Rules`          |

pub mod rules;
pub mod serve;

pub use rules::cmd_rules;
pub use serve::{ServeOverrides, cmd_serve};
