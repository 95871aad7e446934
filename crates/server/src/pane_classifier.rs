//! Pure classifiers over captured pane state.
//!
//! No IO here: callers capture pane text / foreground commands / titles and
//! pass them in, so every heuristic is testable with literal fixtures.

/// Only the tail of a capture is inspected; prompts sit at the bottom.
const TAIL_LINES: usize = 15;

const SHELLS: &[&str] = &[
    "bash", "zsh", "fish", "sh", "dash", "ksh", "mksh", "tcsh", "csh", "nu", "xonsh", "login",
];

/// Why a pane looks blocked on user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingReason {
    YesNoPrompt,
    ApproveDeny,
    ProceedQuestion,
    NumberedChoice,
    PlanConfirmation,
}

/// True when `command` (tmux `pane_current_command`) is an interactive shell.
pub fn is_shell_command(command: &str) -> bool {
    let command = command.trim().trim_start_matches('-');
    let base = command.rsplit('/').next().unwrap_or(command);
    SHELLS.contains(&base)
}

/// Some agents keep the shell as foreground process and signal work only
/// through the pane title: a braille spinner frame or a leading asterisk.
pub fn title_indicates_busy(title: &str) -> bool {
    match title.trim_start().chars().next() {
        Some(c) => is_braille_spinner(c) || c == '*',
        None => false,
    }
}

fn is_braille_spinner(c: char) -> bool {
    // U+2800 is the blank pattern, not a spinner frame.
    ('\u{2801}'..='\u{28FF}').contains(&c)
}

fn is_selector_glyph(c: char) -> bool {
    matches!(c, '❯' | '›' | '▶' | '→')
}

/// Line starts with a selector glyph pointing at a numbered option: `❯ 1. Yes`.
fn is_numbered_selector(line: &str) -> bool {
    let mut chars = line.trim_start().chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !is_selector_glyph(first) {
        return false;
    }
    let rest = chars.as_str().trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    !digits.is_empty() && rest[digits.len()..].starts_with('.')
}

/// Classify the tail of a pane capture.
pub fn waiting_reason(capture: &str) -> Option<WaitingReason> {
    let lines: Vec<&str> = capture
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];

    if tail.iter().any(|l| is_numbered_selector(l)) {
        return Some(WaitingReason::NumberedChoice);
    }

    let text = tail.join("\n").to_lowercase();

    const YES_NO: &[&str] = &["(y/n)", "[y/n]", "(yes/no)", "[yes/no]", "(y/n/a)"];
    if YES_NO.iter().any(|p| text.contains(p)) {
        return Some(WaitingReason::YesNoPrompt);
    }
    if (text.contains("approve") && text.contains("deny"))
        || (text.contains("allow") && text.contains("deny"))
    {
        return Some(WaitingReason::ApproveDeny);
    }
    const PLAN: &[&str] = &[
        "would you like to proceed",
        "ready to code?",
        "approve this plan",
    ];
    if PLAN.iter().any(|p| text.contains(p)) {
        return Some(WaitingReason::PlanConfirmation);
    }
    if text.contains("proceed?") {
        return Some(WaitingReason::ProceedQuestion);
    }
    None
}
