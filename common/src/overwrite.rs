use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::render::RenderGate;

/// Interactive input seam; the terminal in production, scripted answers in tests.
pub trait Prompt: Send + Sync {
    /// Shows `question` and reads one line, `None` at end of input.
    fn ask(&self, question: &str) -> std::io::Result<Option<String>>;

    fn notify(&self, message: &str);
}

#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn ask(&self, question: &str) -> std::io::Result<Option<String>> {
        {
            let mut stderr = std::io::stderr().lock();
            stderr.write_all(question.as_bytes())?;
            stderr.flush()?;
        }
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }

    fn notify(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverwriteDecision {
    Yes,
    No,
    All,
    Quit,
}

impl OverwriteDecision {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(Self::Yes),
            "n" | "no" => Some(Self::No),
            "a" | "all" => Some(Self::All),
            "q" | "quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    AskEach,
    AlwaysYes,
    Aborted,
}

/// What to do with the item whose destination was checked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Write,
    Skip,
    Abort,
}

pub const INVALID_NOTICE: &str = "Invalid option. Use: y (yes), n (no), a (all), q (quit)";

/// Serializes overwrite questions for one operation.
///
/// Only the coordinator consults the negotiator, so at most one question is
/// outstanding. `All` and `Quit` are sticky for the rest of the run.
pub struct Negotiator {
    state: State,
    prompt: Option<Arc<dyn Prompt>>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("state", &self.state)
            .finish()
    }
}

impl Negotiator {
    pub fn new(prompt: Arc<dyn Prompt>) -> Self {
        Self {
            state: State::AskEach,
            prompt: Some(prompt),
        }
    }

    /// Overwrites everything without asking.
    pub fn forced() -> Self {
        Self {
            state: State::AlwaysYes,
            prompt: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn apply(&mut self, decision: OverwriteDecision) -> Resolution {
        match (self.state, decision) {
            (State::Aborted, _) => Resolution::Abort,
            (State::AlwaysYes, _) => Resolution::Write,
            (State::AskEach, OverwriteDecision::Yes) => Resolution::Write,
            (State::AskEach, OverwriteDecision::No) => Resolution::Skip,
            (State::AskEach, OverwriteDecision::All) => {
                self.state = State::AlwaysYes;
                Resolution::Write
            }
            (State::AskEach, OverwriteDecision::Quit) => {
                self.state = State::Aborted;
                Resolution::Abort
            }
        }
    }

    /// Decides whether `destination` may be written, asking only if something is already there.
    pub async fn resolve(
        &mut self,
        destination: &Path,
        gate: &RenderGate,
        cancel: &CancellationToken,
    ) -> Result<Resolution, Error> {
        match self.state {
            State::Aborted => return Ok(Resolution::Abort),
            State::AlwaysYes => return Ok(Resolution::Write),
            State::AskEach => {}
        }
        if tokio::fs::symlink_metadata(destination).await.is_err() {
            return Ok(Resolution::Write);
        }
        let Some(prompt) = self.prompt.clone() else {
            return Ok(Resolution::Write);
        };
        let question = format!("Overwrite '{}'? [y/n/a/q]: ", destination.display());
        loop {
            let answer = {
                let prompt = prompt.clone();
                let gate = gate.clone();
                let question = question.clone();
                let ask = tokio::task::spawn_blocking(move || gate.suspend(|| prompt.ask(&question)));
                tokio::select! {
                    answer = ask => answer
                        .map_err(|err| Error::Io {
                            path: destination.to_owned(),
                            source: std::io::Error::other(err),
                        })?
                        .map_err(|err| Error::from_io(destination, err))?,
                    _ = cancel.cancelled() => {
                        self.state = State::Aborted;
                        return Ok(Resolution::Abort);
                    }
                }
            };
            let Some(line) = answer else {
                tracing::info!("end of input while asking about {:?}, quitting", destination);
                return Ok(self.apply(OverwriteDecision::Quit));
            };
            match OverwriteDecision::parse(&line) {
                Some(decision) => return Ok(self.apply(decision)),
                None => gate.suspend(|| prompt.notify(INVALID_NOTICE)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{self, ScriptedPrompt};
    use anyhow::Result;
    use tracing_test::traced_test;

    #[test]
    fn parses_answers_case_insensitively() {
        assert_eq!(OverwriteDecision::parse("Y\n"), Some(OverwriteDecision::Yes));
        assert_eq!(OverwriteDecision::parse(" no "), Some(OverwriteDecision::No));
        assert_eq!(OverwriteDecision::parse("ALL"), Some(OverwriteDecision::All));
        assert_eq!(OverwriteDecision::parse("q"), Some(OverwriteDecision::Quit));
        assert_eq!(OverwriteDecision::parse("maybe"), None);
        assert_eq!(OverwriteDecision::parse(""), None);
    }

    #[test]
    fn all_and_quit_are_sticky() {
        let mut negotiator = Negotiator::new(Arc::new(ScriptedPrompt::default()));
        assert_eq!(negotiator.apply(OverwriteDecision::No), Resolution::Skip);
        assert_eq!(negotiator.state(), State::AskEach);
        assert_eq!(negotiator.apply(OverwriteDecision::All), Resolution::Write);
        assert_eq!(negotiator.state(), State::AlwaysYes);
        assert_eq!(negotiator.apply(OverwriteDecision::Quit), Resolution::Write);

        let mut negotiator = Negotiator::new(Arc::new(ScriptedPrompt::default()));
        assert_eq!(negotiator.apply(OverwriteDecision::Quit), Resolution::Abort);
        assert_eq!(negotiator.apply(OverwriteDecision::Yes), Resolution::Abort);
        assert_eq!(negotiator.state(), State::Aborted);
    }

    #[tokio::test]
    #[traced_test]
    async fn absent_destination_never_prompts() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let prompt = Arc::new(ScriptedPrompt::new(&["n"]));
        let mut negotiator = Negotiator::new(prompt.clone());
        let resolution = negotiator
            .resolve(
                &tmp_dir.join("absent"),
                &RenderGate::default(),
                &CancellationToken::new(),
            )
            .await?;
        assert_eq!(resolution, Resolution::Write);
        assert_eq!(prompt.asked(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn reprompts_after_invalid_answer() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let existing = tmp_dir.join("existing");
        tokio::fs::write(&existing, "x").await?;
        let prompt = Arc::new(ScriptedPrompt::new(&["what", "a"]));
        let mut negotiator = Negotiator::new(prompt.clone());
        let gate = RenderGate::default();
        let cancel = CancellationToken::new();
        assert_eq!(
            negotiator.resolve(&existing, &gate, &cancel).await?,
            Resolution::Write
        );
        assert_eq!(prompt.asked(), 2);
        assert_eq!(prompt.notices(), 1);
        // "all" answers every later collision without asking
        assert_eq!(
            negotiator.resolve(&existing, &gate, &cancel).await?,
            Resolution::Write
        );
        assert_eq!(prompt.asked(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn end_of_input_quits() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let existing = tmp_dir.join("existing");
        tokio::fs::write(&existing, "x").await?;
        let mut negotiator = Negotiator::new(Arc::new(ScriptedPrompt::default()));
        assert_eq!(
            negotiator
                .resolve(&existing, &RenderGate::default(), &CancellationToken::new())
                .await?,
            Resolution::Abort
        );
        assert_eq!(negotiator.state(), State::Aborted);
        Ok(())
    }

    /// Never answers within a test's patience.
    struct StalledPrompt;

    impl Prompt for StalledPrompt {
        fn ask(&self, _question: &str) -> std::io::Result<Option<String>> {
            std::thread::sleep(std::time::Duration::from_millis(1500));
            Ok(None)
        }

        fn notify(&self, _message: &str) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn interrupt_during_question_lets_progress_finish() -> Result<()> {
        use crate::progress::Progress;
        use crate::render::{ProgressSettings, ProgressType, Renderer};
        use crate::summary::Operation;
        let tmp_dir = testutils::create_temp_dir().await?;
        let existing = tmp_dir.join("existing");
        tokio::fs::write(&existing, "x").await?;
        let renderer = Renderer::start(
            Operation::Copy,
            Arc::new(Progress::new(1, 1)),
            &ProgressSettings {
                progress_type: ProgressType::ProgressBar,
                progress_delay: Some(std::time::Duration::from_millis(10)),
            },
        )?;
        let mut negotiator = Negotiator::new(Arc::new(StalledPrompt));
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            interrupt.cancel();
        });
        let resolution = negotiator
            .resolve(&existing, renderer.gate(), &cancel)
            .await?;
        assert_eq!(resolution, Resolution::Abort);
        let start = std::time::Instant::now();
        renderer.finish();
        assert!(
            start.elapsed() < std::time::Duration::from_secs(1),
            "{:?}",
            start.elapsed()
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn forced_never_prompts() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let existing = tmp_dir.join("existing");
        tokio::fs::write(&existing, "x").await?;
        let mut negotiator = Negotiator::forced();
        assert_eq!(
            negotiator
                .resolve(&existing, &RenderGate::default(), &CancellationToken::new())
                .await?,
            Resolution::Write
        );
        Ok(())
    }
}
