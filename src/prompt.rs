//! Operator prompts ("Ready?", "Happy?").

use crate::model::SessionEvent;
#[cfg(test)]
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use tokio::sync::mpsc::UnboundedSender;

pub trait Prompter {
    /// Ask `question` and return the operator's answer, trimmed.
    fn ask(&mut self, question: &str) -> std::io::Result<String>;
}

/// Answers that reject an acquisition and ask for it to be repeated.
pub fn is_negative(answer: &str) -> bool {
    matches!(answer.trim(), "n" | "N" | "no" | "No")
}

/// Interactive prompts on the terminal.
///
/// With an event channel the question is queued behind the console output
/// already in flight, so it is printed after it rather than interleaved.
#[derive(Debug, Default)]
pub struct StdinPrompter {
    console: Option<UnboundedSender<SessionEvent>>,
}

impl StdinPrompter {
    pub fn new(console: Option<UnboundedSender<SessionEvent>>) -> Self {
        Self { console }
    }
}

impl Prompter for StdinPrompter {
    fn ask(&mut self, question: &str) -> std::io::Result<String> {
        let queued = self.console.as_ref().is_some_and(|tx| {
            tx.send(SessionEvent::Prompt {
                question: question.to_string(),
            })
            .is_ok()
        });
        if !queued {
            let mut out = std::io::stderr();
            write!(out, "{question} ")?;
            out.flush()?;
        }
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

/// Accepts every prompt, for unattended runs.
#[derive(Debug, Default)]
pub struct AutoAccept;

impl Prompter for AutoAccept {
    fn ask(&mut self, _question: &str) -> std::io::Result<String> {
        Ok(String::new())
    }
}

/// Replays canned answers, then accepts. Records the questions asked.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub asked: Vec<String>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str) -> std::io::Result<String> {
        self.asked.push(question.to_string());
        Ok(self.answers.pop_front().unwrap_or_default())
    }
}
