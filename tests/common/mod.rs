//! Behaviors shared across the integration suite.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use parley::behavior::timer_loop;
use parley::message::ErrorInfo;
use parley::{ActionArgs, ActionError, AgentContext, Behavior, BehaviorTypes};

/// Counter with `add(n)` and `count()` actions.
#[derive(Default)]
pub struct Counter {
    count: AtomicI64,
}

#[async_trait]
impl Behavior for Counter {
    async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, ActionError> {
        match name {
            "add" => {
                let n: i64 = args.pos(0)?;
                self.count.fetch_add(n, Ordering::SeqCst);
                Ok(Value::Null)
            }
            "count" => Ok(json!(self.count.load(Ordering::SeqCst))),
            _ => Err(ActionError::UnknownAction(name.to_string())),
        }
    }
}

/// Behavior whose `fails()` action raises `RuntimeError: boom` and
/// whose `sleep(secs)` action dawdles, for cancellation tests.
pub struct Faulty;

#[async_trait]
impl Behavior for Faulty {
    async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, ActionError> {
        match name {
            "fails" => Err(ActionError::failure("RuntimeError", "boom")),
            "sleep" => {
                let secs: f64 = args.pos(0)?;
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(Value::Null)
            }
            "quick" => Ok(json!("ok")),
            _ => Err(ActionError::UnknownAction(name.to_string())),
        }
    }
}

/// Fails `on_setup` for the first `failures` runs, then succeeds.
pub struct FlakySetup {
    failures: usize,
    pub attempts: Arc<AtomicUsize>,
}

impl FlakySetup {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Behavior for FlakySetup {
    async fn on_setup(&self, _ctx: &AgentContext) -> Result<(), ErrorInfo> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            Err(ErrorInfo::new("SetupError", format!("attempt {attempt}")))
        } else {
            Ok(())
        }
    }

    async fn action(&self, name: &str, _args: ActionArgs) -> Result<Value, ActionError> {
        match name {
            "attempts" => Ok(json!(self.attempts.load(Ordering::SeqCst))),
            _ => Err(ActionError::UnknownAction(name.to_string())),
        }
    }
}

/// Ticks a counter from a timer control loop.
#[derive(Default)]
pub struct Ticker {
    pub ticks: AtomicUsize,
}

#[async_trait]
impl Behavior for Ticker {
    async fn action(&self, name: &str, _args: ActionArgs) -> Result<Value, ActionError> {
        match name {
            "ticks" => Ok(json!(self.ticks.load(Ordering::SeqCst))),
            _ => Err(ActionError::UnknownAction(name.to_string())),
        }
    }

    fn control_loops(&self) -> Vec<String> {
        vec!["tick".to_string()]
    }

    async fn control_loop(
        &self,
        _name: &str,
        shutdown: CancellationToken,
    ) -> Result<(), ErrorInfo> {
        timer_loop(Duration::from_millis(5), &shutdown, || {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
    }
}

/// Behavior hierarchy used by the discovery tests.
pub struct PlainA;

#[async_trait]
impl Behavior for PlainA {
    fn behavior_types() -> BehaviorTypes {
        BehaviorTypes::root("A")
    }
}

pub struct PlainB;

#[async_trait]
impl Behavior for PlainB {
    fn behavior_types() -> BehaviorTypes {
        BehaviorTypes::root("B")
    }
}

pub struct DerivedC;

#[async_trait]
impl Behavior for DerivedC {
    fn behavior_types() -> BehaviorTypes {
        BehaviorTypes::root("C").base("B")
    }
}

pub struct DerivedD;

#[async_trait]
impl Behavior for DerivedD {
    fn behavior_types() -> BehaviorTypes {
        BehaviorTypes::root("D").base("B")
    }
}
