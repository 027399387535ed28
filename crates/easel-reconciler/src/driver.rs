//! Reconciliation driver: decoded stream events in, canvas mutations out.

use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use easel_canvas::{CanvasDocument, LayoutPlanner};
use easel_core::config::ReconcilerConfig;
use easel_core::types::{InvocationId, InvocationState, ToolInvocation, TurnId};
use easel_stream::{EventStream, InvocationEventKind, StreamEvent};

use crate::executor::{ExecuteError, Executor};
use crate::registry::{InvocationUpdate, Registry, UpdateKind};
use crate::{ReconcilerEvent, TurnSummary};

const INCOMPLETE_AT_END: &str = "arguments incomplete at end of stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Streaming(TurnId),
    Draining(TurnId),
    Cancelled(TurnId),
}

pub struct Reconciler<C: CanvasDocument> {
    canvas: C,
    registry: Registry,
    executor: Executor,
    config: ReconcilerConfig,
    state: DriverState,
    queue: VecDeque<InvocationId>,
    summary: TurnSummary,
    /// Turns that have finished. Late events for them are dropped.
    closed_turns: HashSet<TurnId>,
    /// Last finished turn; its invocations are discarded when the next turn begins.
    finished_turn: Option<TurnId>,
}

impl<C: CanvasDocument> Reconciler<C> {
    pub fn new(canvas: C) -> Self {
        Self::with_config(canvas, LayoutPlanner::default(), ReconcilerConfig::default())
    }

    pub fn with_config(canvas: C, planner: LayoutPlanner, config: ReconcilerConfig) -> Self {
        Self {
            canvas,
            registry: Registry::new(),
            executor: Executor::new(planner),
            config,
            state: DriverState::Idle,
            queue: VecDeque::new(),
            summary: TurnSummary::default(),
            closed_turns: HashSet::new(),
            finished_turn: None,
        }
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    pub fn canvas_mut(&mut self) -> &mut C {
        &mut self.canvas
    }

    pub fn into_canvas(self) -> C {
        self.canvas
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process one decoded event to completion.
    pub fn handle_event(&mut self, event: StreamEvent, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        let turn = event.turn_id().to_string();

        match &self.state {
            DriverState::Cancelled(active) if *active == turn => {
                self.absorb_after_cancel(event, tx);
                return;
            }
            DriverState::Streaming(active) if *active == turn => {}
            _ if self.closed_turns.contains(&turn) => {
                debug!(turn_id = %turn, "Dropping event for a closed turn");
                return;
            }
            DriverState::Streaming(active) => {
                info!(previous = %active, turn_id = %turn, "New turn supersedes active turn");
                self.cancel_active(tx);
                self.finish_turn(tx);
                self.begin_turn(&turn, tx);
            }
            DriverState::Cancelled(_) => {
                self.finish_turn(tx);
                self.begin_turn(&turn, tx);
            }
            DriverState::Idle | DriverState::Draining(_) => self.begin_turn(&turn, tx),
        }

        match event {
            StreamEvent::TurnStarted { .. } => {}
            StreamEvent::Text { turn_id, delta } => {
                let _ = tx.send(ReconcilerEvent::TextDelta { turn_id, delta });
            }
            StreamEvent::Invocation(ev) => {
                if let InvocationEventKind::Result(result) = &ev.kind {
                    let _ = tx.send(ReconcilerEvent::AgentResult {
                        invocation_id: ev.invocation_id.clone(),
                        tool: ev.name.clone(),
                        result: result.clone(),
                    });
                }
                let id = ev.invocation_id.clone();
                let outcome = self.registry.upsert(InvocationUpdate::from(ev));
                if outcome.newly_failed {
                    self.summary.failed += 1;
                    self.emit_result(&id, tx);
                }
                if outcome.newly_complete {
                    debug!(invocation_id = %id, "Queued for execution");
                    self.queue.push_back(id);
                }
                self.drain_queue(tx);
            }
            StreamEvent::AgentError { turn_id, message } => {
                let _ = tx.send(ReconcilerEvent::AgentError { turn_id, message });
            }
            StreamEvent::TurnFinished { finish_reason, .. } => {
                debug!(turn_id = %turn, ?finish_reason, "Agent finished turn");
                self.finish_turn(tx);
            }
        }
    }

    /// Cancel the active turn. Invocations not yet executing never will.
    pub fn cancel_turn(&mut self, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        if let DriverState::Streaming(_) = self.state {
            self.cancel_active(tx);
        }
    }

    /// Stream ended: close whatever turn is still open.
    pub fn end_of_stream(&mut self, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        if self.state != DriverState::Idle {
            self.finish_turn(tx);
        }
    }

    /// Run one agent stream to completion (or cancellation).
    pub async fn run_turn(
        &mut self,
        mut stream: EventStream,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<ReconcilerEvent>,
    ) -> TurnSummary {
        if self.state == DriverState::Idle {
            self.summary = TurnSummary::default();
            // Turn ids are only unique within one stream.
            self.closed_turns.clear();
        }
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Turn cancelled");
                    self.cancel_turn(&tx);
                    self.summary.aborted = true;
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => self.handle_event(event, &tx),
                    Some(Err(e)) => {
                        warn!(%e, "Agent stream failed");
                        let turn_id = self.active_turn().unwrap_or_default().to_string();
                        let _ = tx.send(ReconcilerEvent::AgentError {
                            turn_id,
                            message: e.to_string(),
                        });
                        break;
                    }
                    None => break,
                },
            }
        }

        if self.state != DriverState::Idle {
            self.finish_turn(&tx);
        }
        self.summary.clone()
    }

    /// Conversation reset: forget every invocation and record.
    pub fn reset(&mut self) {
        self.registry.reset();
        self.queue.clear();
        self.state = DriverState::Idle;
        self.summary = TurnSummary::default();
        self.closed_turns.clear();
        self.finished_turn = None;
    }

    fn active_turn(&self) -> Option<&str> {
        match &self.state {
            DriverState::Idle => None,
            DriverState::Streaming(t) | DriverState::Draining(t) | DriverState::Cancelled(t) => {
                Some(t)
            }
        }
    }

    fn begin_turn(&mut self, turn: &str, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        if let Some(previous) = self.finished_turn.take() {
            self.registry.discard_turn(&previous);
        }
        debug!(turn_id = %turn, "Turn streaming");
        self.state = DriverState::Streaming(turn.to_string());
        self.summary = TurnSummary {
            turn_id: turn.to_string(),
            ..Default::default()
        };
        let _ = tx.send(ReconcilerEvent::TurnStarted {
            turn_id: turn.to_string(),
        });
    }

    fn cancel_active(&mut self, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        let DriverState::Streaming(turn) = &self.state else {
            return;
        };
        let turn = turn.clone();
        let cancelled = self.registry.cancel_turn(&turn);
        self.queue.clear();
        info!(turn_id = %turn, cancelled = cancelled.len(), "Cancelling turn");
        self.summary.cancelled += cancelled.len();
        self.summary.aborted = true;
        for id in &cancelled {
            self.emit_result(id, tx);
        }
        self.state = DriverState::Cancelled(turn);
    }

    /// Events for a cancelled turn: tracked, never executed.
    fn absorb_after_cancel(&mut self, event: StreamEvent, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        match event {
            StreamEvent::Invocation(ev) => {
                let id = ev.invocation_id.clone();
                self.registry.upsert(InvocationUpdate::from(ev));
                let cancellable = self
                    .registry
                    .get(&id)
                    .is_some_and(|inv| inv.state.is_cancellable());
                if cancellable {
                    let update = self.update_for(&id, UpdateKind::Advance(InvocationState::Cancelled));
                    self.registry.upsert(update);
                }
            }
            StreamEvent::TurnFinished { .. } => self.finish_turn(tx),
            _ => {}
        }
    }

    fn drain_queue(&mut self, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        while let Some(id) = self.queue.pop_front() {
            let Some(invocation) = self.registry.get(&id).cloned() else {
                continue;
            };

            if self.registry.has_executed(&id) {
                info!(invocation_id = %id, "Duplicate delivery, already executed");
                self.summary.skipped_duplicates += 1;
                self.settle_duplicate(&invocation);
                continue;
            }
            if invocation.state != InvocationState::ArgsComplete {
                continue;
            }

            let update = self.update_for(&id, UpdateKind::Advance(InvocationState::Executing));
            self.registry.upsert(update);
            let _ = tx.send(ReconcilerEvent::ToolCall {
                invocation_id: id.clone(),
                tool: invocation.name.clone(),
                args: invocation.args.clone().unwrap_or_default(),
            });

            match self
                .executor
                .execute(&mut self.registry, &mut self.canvas, &invocation)
            {
                Ok(outcome) => {
                    if outcome.is_success() {
                        self.summary.executed += 1;
                    } else {
                        self.summary.failed += 1;
                    }
                    self.emit_result(&id, tx);
                }
                Err(ExecuteError::AlreadyExecuted(_)) => {
                    self.summary.skipped_duplicates += 1;
                }
                Err(e) => {
                    warn!(invocation_id = %id, %e, "Execution refused");
                    self.summary.failed += 1;
                }
            }
        }
    }

    /// A re-delivered invocation takes the state of its existing record.
    fn settle_duplicate(&mut self, invocation: &ToolInvocation) {
        let Some(record) = self.registry.record(&invocation.id) else {
            return;
        };
        let kind = if record.outcome.is_success() {
            UpdateKind::Advance(InvocationState::Executed)
        } else {
            UpdateKind::Fail(record.outcome.message().to_string())
        };
        let update = self.update_for(&invocation.id, kind);
        self.registry.upsert(update);
    }

    fn finish_turn(&mut self, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        let turn = match &self.state {
            DriverState::Streaming(t) => t.clone(),
            DriverState::Cancelled(_) | DriverState::Draining(_) | DriverState::Idle => {
                if let Some(turn) = self.active_turn().map(str::to_string) {
                    info!(turn_id = %turn, cancelled = self.summary.cancelled, "Turn closed");
                    self.close(turn);
                }
                self.state = DriverState::Idle;
                let _ = tx.send(ReconcilerEvent::TurnFinished {
                    summary: self.summary.clone(),
                });
                return;
            }
        };

        self.state = DriverState::Draining(turn.clone());
        self.drain_queue(tx);

        if self.config.fail_incomplete_on_drain {
            let incomplete: Vec<InvocationId> = self
                .registry
                .turn_invocations(&turn)
                .into_iter()
                .filter(|inv| inv.state == InvocationState::Streaming)
                .map(|inv| inv.id.clone())
                .collect();
            for id in incomplete {
                warn!(invocation_id = %id, turn_id = %turn, "Arguments never completed");
                let update = self.update_for(&id, UpdateKind::Fail(INCOMPLETE_AT_END.into()));
                if self.registry.upsert(update).newly_failed {
                    self.summary.failed += 1;
                    self.emit_result(&id, tx);
                }
            }
        }

        info!(
            turn_id = %turn,
            executed = self.summary.executed,
            failed = self.summary.failed,
            cancelled = self.summary.cancelled,
            "Turn finished"
        );
        self.close(turn);
        self.state = DriverState::Idle;
        let _ = tx.send(ReconcilerEvent::TurnFinished {
            summary: self.summary.clone(),
        });
    }

    fn close(&mut self, turn: TurnId) {
        self.closed_turns.insert(turn.clone());
        self.finished_turn = Some(turn);
    }

    fn update_for(&self, id: &str, kind: UpdateKind) -> InvocationUpdate {
        let (turn_id, name) = self
            .registry
            .get(id)
            .map(|inv| (inv.turn_id.clone(), inv.name.clone()))
            .unwrap_or_default();
        InvocationUpdate {
            id: id.to_string(),
            turn_id,
            name,
            kind,
        }
    }

    fn emit_result(&self, id: &str, tx: &mpsc::UnboundedSender<ReconcilerEvent>) {
        let Some(inv) = self.registry.get(id) else {
            return;
        };
        let (content, is_error) = inv
            .result
            .as_ref()
            .map(|r| (r.content.clone(), r.is_error))
            .unwrap_or_default();
        let _ = tx.send(ReconcilerEvent::ToolResult {
            invocation_id: id.to_string(),
            tool: inv.name.clone(),
            content,
            is_error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_canvas::InMemoryCanvas;
    use easel_core::types::Point;
    use easel_stream::InvocationEvent;
    use serde_json::{Value, json};

    fn channel() -> (
        mpsc::UnboundedSender<ReconcilerEvent>,
        mpsc::UnboundedReceiver<ReconcilerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    fn inv(turn: &str, id: &str, kind: InvocationEventKind) -> StreamEvent {
        StreamEvent::Invocation(InvocationEvent {
            invocation_id: id.into(),
            turn_id: turn.into(),
            name: "create_variation_nodes".into(),
            kind,
        })
    }

    fn complete(turn: &str, id: &str, args: Value) -> StreamEvent {
        inv(turn, id, InvocationEventKind::Complete(args))
    }

    fn variations(n: usize) -> Value {
        let names: Vec<String> = (0..n).map(|i| format!("v{i}")).collect();
        json!({"count": n, "variations": names})
    }

    #[test]
    fn test_duplicate_completion_executes_once() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(complete("t1", "a", variations(2)), &tx);
        r.handle_event(complete("t1", "a", variations(2)), &tx);
        assert_eq!(r.canvas().len(), 2);
        assert_eq!(r.registry().records().len(), 1);
    }

    #[test]
    fn test_redelivery_in_new_turn_is_skipped() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(complete("t1", "a", variations(1)), &tx);
        r.handle_event(complete("t2", "a", variations(1)), &tx);
        assert_eq!(r.canvas().len(), 1);
        assert_eq!(
            r.registry().get("a").unwrap().state,
            InvocationState::Executed
        );
    }

    #[test]
    fn test_fifo_by_completion_order() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(inv("t1", "first", InvocationEventKind::Fragment("{".into())), &tx);
        r.handle_event(complete("t1", "second", variations(1)), &tx);
        r.handle_event(complete("t1", "first", variations(1)), &tx);
        let order: Vec<&str> = r
            .registry()
            .records()
            .iter()
            .map(|rec| rec.invocation_id.as_str())
            .collect();
        assert_eq!(order, vec!["second", "first"]);
    }

    #[test]
    fn test_cancel_while_streaming() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(inv("t1", "a", InvocationEventKind::Fragment("{\"count\":1".into())), &tx);
        r.cancel_turn(&tx);
        assert_eq!(r.state(), &DriverState::Cancelled("t1".into()));

        r.handle_event(complete("t1", "a", variations(1)), &tx);
        r.handle_event(complete("t1", "b", variations(1)), &tx);
        assert!(r.canvas().is_empty());
        assert!(r.registry().records().is_empty());
        assert_eq!(r.registry().get("a").unwrap().state, InvocationState::Cancelled);
        assert_eq!(r.registry().get("b").unwrap().state, InvocationState::Cancelled);
    }

    #[test]
    fn test_new_turn_discards_previous() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(inv("t1", "a", InvocationEventKind::Fragment("{".into())), &tx);
        r.handle_event(
            StreamEvent::TurnStarted {
                turn_id: "t2".into(),
            },
            &tx,
        );
        assert_eq!(r.state(), &DriverState::Streaming("t2".into()));
        assert!(r.registry().get("a").is_none());

        r.handle_event(complete("t2", "b", variations(1)), &tx);
        assert_eq!(r.canvas().len(), 1);
    }

    fn started(turn: &str) -> StreamEvent {
        StreamEvent::TurnStarted {
            turn_id: turn.into(),
        }
    }

    fn finished(turn: &str) -> StreamEvent {
        StreamEvent::TurnFinished {
            turn_id: turn.into(),
            finish_reason: None,
        }
    }

    #[test]
    fn test_late_completion_for_cancelled_turn_is_dropped() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(inv("t1", "a", InvocationEventKind::Fragment("{\"count\":1".into())), &tx);
        r.cancel_turn(&tx);
        r.handle_event(started("t2"), &tx);
        r.handle_event(inv("t2", "b", InvocationEventKind::Fragment("{".into())), &tx);

        r.handle_event(complete("t1", "a", variations(1)), &tx);

        assert!(r.canvas().is_empty());
        assert!(r.registry().records().is_empty());
        assert!(r.registry().get("a").is_none());
        assert_eq!(r.state(), &DriverState::Streaming("t2".into()));
        assert_eq!(r.registry().get("b").unwrap().state, InvocationState::Streaming);
    }

    #[test]
    fn test_late_event_for_finished_turn_is_dropped() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(complete("t1", "a", variations(1)), &tx);
        r.handle_event(finished("t1"), &tx);
        r.handle_event(started("t2"), &tx);

        r.handle_event(complete("t1", "late", variations(1)), &tx);

        assert_eq!(r.state(), &DriverState::Streaming("t2".into()));
        assert!(r.registry().get("late").is_none());
        assert_eq!(r.canvas().len(), 1);
    }

    #[test]
    fn test_finished_turns_are_discarded() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        for i in 0..5 {
            let turn = format!("t{i}");
            r.handle_event(complete(&turn, &format!("call-{i}"), variations(1)), &tx);
            r.handle_event(finished(&turn), &tx);
        }
        assert_eq!(r.registry().len(), 1);
        assert!(r.registry().get("call-4").is_some());
        assert_eq!(r.registry().records().len(), 5);
        assert_eq!(r.canvas().len(), 5);
    }

    #[test]
    fn test_cancelled_turn_reports_summary_on_finish() {
        let (tx, mut rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(inv("t1", "a", InvocationEventKind::Fragment("{".into())), &tx);
        r.cancel_turn(&tx);
        r.handle_event(finished("t1"), &tx);
        assert_eq!(r.state(), &DriverState::Idle);

        let mut summaries = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ReconcilerEvent::TurnFinished { summary } = event {
                summaries.push(summary);
            }
        }
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].turn_id, "t1");
        assert_eq!(summaries[0].cancelled, 1);
        assert!(summaries[0].aborted);

        r.handle_event(started("t2"), &tx);
        assert!(r.registry().get("a").is_none());
    }

    #[test]
    fn test_drain_fails_incomplete() {
        let (tx, mut rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        r.handle_event(inv("t1", "a", InvocationEventKind::Fragment("{".into())), &tx);
        r.handle_event(
            StreamEvent::TurnFinished {
                turn_id: "t1".into(),
                finish_reason: None,
            },
            &tx,
        );
        assert_eq!(r.state(), &DriverState::Idle);
        assert_eq!(r.registry().get("a").unwrap().state, InvocationState::Failed);

        let mut summary = None;
        while let Ok(event) = rx.try_recv() {
            if let ReconcilerEvent::TurnFinished { summary: s } = event {
                summary = Some(s);
            }
        }
        assert_eq!(summary.unwrap().failed, 1);
    }

    #[test]
    fn test_drain_can_leave_incomplete() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::with_config(
            InMemoryCanvas::default(),
            LayoutPlanner::default(),
            ReconcilerConfig {
                fail_incomplete_on_drain: false,
            },
        );
        r.handle_event(inv("t1", "a", InvocationEventKind::Fragment("{".into())), &tx);
        r.end_of_stream(&tx);
        assert_eq!(r.registry().get("a").unwrap().state, InvocationState::Streaming);
    }

    #[test]
    fn test_reset_forgets_records() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::new(Point::default()));
        r.handle_event(complete("t1", "a", variations(1)), &tx);
        r.reset();
        assert!(r.registry().records().is_empty());
        assert_eq!(r.state(), &DriverState::Idle);
    }

    #[tokio::test]
    async fn test_run_turn_precancelled_executes_nothing() {
        let (tx, _rx) = channel();
        let mut r = Reconciler::new(InMemoryCanvas::default());
        let stream: EventStream = Box::pin(futures::stream::iter(vec![Ok(complete(
            "t1",
            "a",
            variations(1),
        ))]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = r.run_turn(stream, cancel, tx).await;
        assert!(summary.aborted);
        assert!(r.canvas().is_empty());
    }
}
