//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `run`       | `Run`            |
//! | `validate`  | `Validate`       |
//! | `models`    | `Models`         |

pub mod models;
pub mod run;
pub mod validate;

pub use models::cmd_models;
pub use run::cmd_run;
pub use validate::cmd_validate;
