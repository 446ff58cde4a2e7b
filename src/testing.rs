//! Test doubles shared by unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::{CommandOutput, CommandRunner, Invocation};

type Responder = Box<dyn Fn(&Invocation) -> Result<CommandOutput> + Send + Sync>;

/// Records invocations and answers each through a closure.
pub struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    respond: Responder,
}

impl FakeRunner {
    pub fn new(
        respond: impl Fn(&Invocation) -> Result<CommandOutput> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Answers every command with empty successful output.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Ok(CommandOutput::ok("")))
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines of every recorded call.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        (self.respond)(invocation)
    }
}
