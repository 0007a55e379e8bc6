use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};

const PROGRESS_SCALE: u64 = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

/// Rich output only when stdout is a terminal and `NO_COLOR` is unset.
pub fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if std::io::stdout().is_terminal() && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
}

pub struct TerminalProgress {
    style: OutputStyle,
    label: String,
    last_message: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub fn print_section(self, title: &str) {
        if self.style == OutputStyle::Plain {
            return;
        }
        println!();
        println!("{}", colorize(section_style(), &format!("== {title} ==")));
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub fn start_progress(self, label: &str) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(PROGRESS_SCALE);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<36!} [{bar:20.cyan/blue}] {percent:>3}% {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars(".:;* ").progress_chars("=>-"));
            }
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            last_message: String::new(),
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    /// `fraction: None` leaves the bar where it is and only spins.
    pub fn update(&mut self, message: &str, fraction: Option<f32>) {
        let message_changed = self.last_message != message;
        if message_changed {
            self.last_message = message.to_string();
        }

        match &self.progress_bar {
            Some(progress_bar) => {
                if message_changed {
                    progress_bar.set_message(message.to_string());
                }
                if let Some(fraction) = fraction {
                    progress_bar.set_position(scaled_position(fraction));
                }
            }
            None => {
                if message_changed {
                    println!("{}", render_status_line(self.style, "..", message));
                }
            }
        }
    }

    /// Runs `f` with the bar hidden, for interactive prompts.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.suspend(f),
            None => f(),
        }
    }

    pub fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        println!(
            "{} finished in {}",
            colorize(progress_label_style(), &self.label),
            format_elapsed(self.started_at.elapsed())
        );
    }
}

fn scaled_position(fraction: f32) -> u64 {
    (fraction.clamp(0.0, 1.0) * PROGRESS_SCALE as f32).round() as u64
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let (badge, badge_style) = status_badge(status);
            format!("{} {message}", colorize(badge_style, badge))
        }
    }
}

fn status_badge(status: &str) -> (&'static str, Style) {
    match status {
        "ok" => ("[OK]", Style::new().fg_color(Some(AnsiColor::Green.into()))),
        "warn" => ("[WARN]", Style::new().fg_color(Some(AnsiColor::Yellow.into()))),
        "err" => (
            "[ERR]",
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        ),
        "step" => ("[>>]", Style::new().fg_color(Some(AnsiColor::Cyan.into()))),
        _ => ("[..]", Style::new()),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

/// Wraps `text` in `style`; an empty style renders as plain text.
pub fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
