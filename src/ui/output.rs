//! Status lines, styled with cliclack on a terminal and tagged plain text elsewhere

use super::context::UiContext;
use console::{style, StyledObject};
use std::fmt::Display;
use std::io;

#[derive(Debug, Clone, Copy)]
enum Level {
    Ok,
    Info,
    Warn,
    Fail,
}

impl Level {
    fn tag(self) -> StyledObject<&'static str> {
        match self {
            Self::Ok => style("[OK]").green(),
            Self::Info => style("[INFO]").cyan(),
            Self::Warn => style("[WARN]").yellow(),
            Self::Fail => style("[FAIL]").red(),
        }
    }

    fn log(self, text: impl Display) -> io::Result<()> {
        match self {
            Self::Ok => cliclack::log::success(text),
            Self::Info => cliclack::log::info(text),
            Self::Warn => cliclack::log::warning(text),
            Self::Fail => cliclack::log::error(text),
        }
    }
}

/// One indented step; `detail` is dimmed on a terminal
fn step(ctx: &UiContext, level: Level, message: &str, detail: Option<(&str, &str)>) {
    if ctx.use_fancy_output() {
        let text = match detail {
            Some((sep, d)) => format!("{}{}{}", message, sep, style(d).dim()),
            None => message.to_string(),
        };
        level.log(text).ok();
    } else {
        match detail {
            Some((sep, d)) => println!("  {} {}{}{}", level.tag(), message, sep, d),
            None => println!("  {} {}", level.tag(), message),
        }
    }
}

fn outro(ctx: &UiContext, level: Level, message: &str) {
    if ctx.use_fancy_output() {
        let text = match level {
            Level::Fail => style(message).red().bold(),
            _ => style(message).green().bold(),
        };
        cliclack::outro(text).ok();
    } else {
        let tag = match level {
            Level::Fail => style("[ERROR]").red(),
            _ => level.tag(),
        };
        println!();
        println!("{} {}", tag, message);
    }
}

pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::intro(style(title).blue().bold()).ok();
    } else {
        println!("{}", style(title).bold());
        println!();
    }
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Ok, message);
}

pub fn outro_error(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Fail, message);
}

/// Bold header for a group of steps
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.use_fancy_output() {
        Level::Info.log(style(title).bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    step(ctx, Level::Ok, message, None);
}

/// `message (detail)`
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        Level::Ok
            .log(format!("{} ({})", message, style(detail).dim()))
            .ok();
    } else {
        println!("  {} {} ({})", Level::Ok.tag(), message, detail);
    }
}

pub fn step_info(ctx: &UiContext, message: &str) {
    step(ctx, Level::Info, message, None);
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    step(ctx, Level::Warn, message, None);
}

/// Warning followed by a dimmed suggestion
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    step(ctx, Level::Warn, message, Some((" - ", hint)));
}

pub fn step_error(ctx: &UiContext, message: &str) {
    step(ctx, Level::Fail, message, None);
}

pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        println!("  {}", style(message).dim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_non_interactive() {
        let ctx = UiContext::non_interactive();
        intro(&ctx, "multipackager build");
        section(&ctx, "debian sid amd64");
        step_ok_detail(&ctx, "Package built", "hello.sid_1.0~debian0_amd64.deb");
        step_warn_hint(&ctx, "Nothing to update", "No targets configured");
        step_error(&ctx, "rpmbuild failed");
        remark(&ctx, "/var/opt/multipackager");
        outro_success(&ctx, "Done");
        outro_error(&ctx, "1 of 2 targets failed");
    }
}
