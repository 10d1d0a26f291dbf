use crate::ingest::workqueue::WorkQueueError;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// One reversible unit of work in a commit plan.
#[async_trait]
pub trait Step: Send {
	/// Human readable description used in logs and failure reasons.
	fn description(&self) -> String;

	async fn apply(&mut self) -> Result<(), StepError>;

	/// Reverts a successful [`Step::apply`]. Only called for steps that were applied.
	async fn rollback(&mut self) -> Result<(), StepError>;
}

#[derive(Debug, Error)]
pub enum StepError {
	#[error("I/O error on {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Destination {} already exists", .0.display())]
	DestinationExists(PathBuf),
	#[error(transparent)]
	WorkQueue(#[from] WorkQueueError),
	#[error("{0}")]
	Other(String),
}

impl StepError {
	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}
}

/// The first forward action that failed, after the plan was rolled back.
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct ProcessorError {
	pub step: String,
	#[source]
	pub source: StepError,
}

impl ProcessorError {
	/// The plan lost a race for its destination against another plan.
	pub const fn is_destination_taken(&self) -> bool {
		matches!(self.source, StepError::DestinationExists(_))
	}
}

/// Applies an ordered list of [`Step`]s all-or-nothing.
///
/// Steps are applied strictly in order. When a step fails, every previously applied step is
/// rolled back in reverse order. Rollback is best-effort: a failing rollback is logged and the
/// remaining steps are still rolled back.
///
/// [`CommandProcessor::execute`] consumes the processor, so no step can be added once execution
/// has started. The processor does not isolate concurrent plans from each other.
pub struct CommandProcessor {
	description: String,
	steps: Vec<Box<dyn Step>>,
}

impl CommandProcessor {
	pub fn new(description: impl Into<String>) -> Self {
		Self {
			description: description.into(),
			steps: Vec::new(),
		}
	}

	pub fn add_step(&mut self, step: impl Step + 'static) {
		self.steps.push(Box::new(step));
	}

	#[must_use]
	pub fn with_step(mut self, step: impl Step + 'static) -> Self {
		self.add_step(step);
		self
	}

	pub fn description(&self) -> &str {
		&self.description
	}

	pub fn len(&self) -> usize {
		self.steps.len()
	}

	pub fn is_empty(&self) -> bool {
		self.steps.is_empty()
	}

	/// Applies all steps and returns how many were applied.
	#[instrument(skip_all, fields(plan = %self.description))]
	pub async fn execute(mut self) -> Result<usize, ProcessorError> {
		let mut applied = 0;
		while applied < self.steps.len() {
			let step = &mut self.steps[applied];
			debug!("Applying {}", step.description());
			if let Err(source) = step.apply().await {
				let step = step.description();
				warn!("{step} failed, rolling back {applied} applied step(s): {source}");
				self.rollback(applied).await;
				return Err(ProcessorError { step, source });
			}
			applied += 1;
		}
		Ok(applied)
	}

	async fn rollback(&mut self, applied: usize) {
		for step in self.steps[..applied].iter_mut().rev() {
			debug!("Rolling back {}", step.description());
			if let Err(err) = step.rollback().await {
				warn!("Failed to roll back {}: {err}", step.description());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};

	/// Records every call into a shared journal.
	struct JournalStep {
		name: &'static str,
		journal: Arc<Mutex<Vec<String>>>,
		fail_apply: bool,
		fail_rollback: bool,
	}

	impl JournalStep {
		fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
			Self {
				name,
				journal: Arc::clone(journal),
				fail_apply: false,
				fail_rollback: false,
			}
		}

		fn failing(mut self) -> Self {
			self.fail_apply = true;
			self
		}

		fn failing_rollback(mut self) -> Self {
			self.fail_rollback = true;
			self
		}
	}

	#[async_trait]
	impl Step for JournalStep {
		fn description(&self) -> String {
			self.name.to_owned()
		}

		async fn apply(&mut self) -> Result<(), StepError> {
			self.journal
				.lock()
				.unwrap()
				.push(format!("apply {}", self.name));
			if self.fail_apply {
				Err(StepError::Other(format!("{} broke", self.name)))
			} else {
				Ok(())
			}
		}

		async fn rollback(&mut self) -> Result<(), StepError> {
			self.journal
				.lock()
				.unwrap()
				.push(format!("rollback {}", self.name));
			if self.fail_rollback {
				Err(StepError::Other(format!("{} stuck", self.name)))
			} else {
				Ok(())
			}
		}
	}

	fn journal() -> Arc<Mutex<Vec<String>>> {
		Arc::new(Mutex::new(Vec::new()))
	}

	#[tokio::test]
	async fn applies_all_steps_in_order() {
		let journal = journal();
		let processor = CommandProcessor::new("plan")
			.with_step(JournalStep::new("a", &journal))
			.with_step(JournalStep::new("b", &journal))
			.with_step(JournalStep::new("c", &journal));

		assert_eq!(processor.execute().await.unwrap(), 3);
		assert_eq!(*journal.lock().unwrap(), ["apply a", "apply b", "apply c"]);
	}

	#[tokio::test]
	async fn empty_plan_succeeds() {
		let processor = CommandProcessor::new("nothing to do");
		assert!(processor.is_empty());
		assert_eq!(processor.execute().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn rolls_back_applied_steps_in_reverse_order() {
		let journal = journal();
		let processor = CommandProcessor::new("plan")
			.with_step(JournalStep::new("a", &journal))
			.with_step(JournalStep::new("b", &journal))
			.with_step(JournalStep::new("c", &journal).failing())
			.with_step(JournalStep::new("d", &journal));

		let err = processor.execute().await.unwrap_err();

		assert_eq!(err.step, "c");
		assert_eq!(err.to_string(), "c failed: c broke");
		assert_eq!(
			*journal.lock().unwrap(),
			["apply a", "apply b", "apply c", "rollback b", "rollback a"]
		);
	}

	#[tokio::test]
	async fn second_step_failure_rolls_back_first_exactly_once() {
		let journal = journal();
		let processor = CommandProcessor::new("plan")
			.with_step(JournalStep::new("move", &journal))
			.with_step(JournalStep::new("register", &journal).failing());

		assert!(processor.execute().await.is_err());

		let journal = journal.lock().unwrap();
		let rollbacks = journal.iter().filter(|e| *e == "rollback move").count();
		assert_eq!(rollbacks, 1);
		assert!(!journal.iter().any(|e| e == "rollback register"));
	}

	#[tokio::test]
	async fn failing_rollback_does_not_stop_remaining_rollbacks() {
		let journal = journal();
		let processor = CommandProcessor::new("plan")
			.with_step(JournalStep::new("a", &journal))
			.with_step(JournalStep::new("b", &journal).failing_rollback())
			.with_step(JournalStep::new("c", &journal).failing());

		let err = processor.execute().await.unwrap_err();

		// The first forward error is reported, not the rollback error.
		assert_eq!(err.step, "c");
		assert_eq!(
			*journal.lock().unwrap(),
			["apply a", "apply b", "apply c", "rollback b", "rollback a"]
		);
	}
}
