//! Terminal output for the command layer
//!
//! `cliclack` renders steps and prompts on a terminal; under CI or when
//! piped, every function falls back to tagged plain text (`[OK]`, `[FAIL]`).
//!
//! ```rust,ignore
//! use multipackager::ui::{self, UiContext};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//! ui::intro(&ctx, "multipackager clear-cache");
//! if ui::confirm(&ctx, "Remove every cached environment?", true).await? {
//!     ui::step_ok(&ctx, "debian sid amd64");
//! }
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, outro_error, outro_success, remark, section, step_error, step_info, step_ok,
    step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::TaskSpinner;
pub use prompts::confirm;
pub use theme::{init_theme, MultipackagerTheme};
