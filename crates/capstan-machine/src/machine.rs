use crate::error::MachineError;
use crate::resume::{ResumeSlot, ResumeToken, Woken, resume_pair};
use crate::rng::DeterministicRng;
use capstan_types::activation::{
    ActivityResolution, ChildWorkflowResult, ChildWorkflowStartStatus, InitializeWorkflow,
    WorkflowActivation,
};
use capstan_types::command::{
    ContinueAsNewWorkflowExecution, ScheduleActivity, ScheduleLocalActivity,
    SignalExternalWorkflowExecution, StartChildWorkflowExecution, StartTimer, WorkflowCommand,
};
use capstan_types::failure::TemporalFailure;
use capstan_types::options::{ActivityCancellationType, ChildWorkflowCancellationType};
use capstan_types::payload::Payload;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// What `drain_commands` hands back for one activation.
#[derive(Debug)]
pub enum ActivationOutcome {
    SendCommands(Vec<WorkflowCommand>),
    FailActivation(TemporalFailure),
}

/// Per-class sequence counters. Monotonic for the life of the instance,
/// never reused; each allocation correlates one command with exactly one
/// later resolution job.
#[derive(Debug, Default)]
struct SeqCounters {
    timer: u32,
    activity: u32,
    child_workflow: u32,
    external_signal: u32,
    condition: u32,
}

fn bump(counter: &mut u32) -> u32 {
    let seq = *counter;
    *counter += 1;
    seq
}

struct PendingActivity {
    slot: ResumeSlot<ActivityResolution>,
    is_local: bool,
    cancellation_type: ActivityCancellationType,
    /// Kept for local activities so a backoff resolution can re-issue the
    /// schedule with the bumped attempt.
    local_schedule: Option<Box<ScheduleLocalActivity>>,
}

struct PendingChildStart {
    workflow_id: String,
    slot: ResumeSlot<ChildWorkflowStartStatus>,
}

struct PendingChildResult {
    slot: ResumeSlot<ChildWorkflowResult>,
    cancellation_type: ChildWorkflowCancellationType,
}

struct ConditionEntry {
    predicate: Rc<dyn Fn() -> bool>,
    slot: ResumeSlot<()>,
}

/// The single source of truth for one cached workflow run.
///
/// Every workflow-visible effect either appends a command and parks a resume
/// token, consumes a bridge job and resolves a token, or reads the clock,
/// flags, and seeds. The machine is exclusively owned by its instance;
/// callers must be on the instance's executor or applying bridge jobs.
pub struct WorkflowMachine {
    run_id: String,

    // Reflects the activation currently being processed.
    current_time: DateTime<Utc>,
    replaying: bool,
    history_length: u32,
    history_size_bytes: u64,
    continue_as_new_suggested: bool,

    rng: DeterministicRng,

    /// `Some(context)` while the author surface is read-only.
    frozen: Option<&'static str>,

    seqs: SeqCounters,
    timers: HashMap<u32, ResumeSlot<()>>,
    activities: HashMap<u32, PendingActivity>,
    child_starts: HashMap<u32, PendingChildStart>,
    child_results: HashMap<u32, PendingChildResult>,
    external_signals: HashMap<u32, ResumeSlot<Option<TemporalFailure>>>,
    /// Keyed by condition seq; iteration order is registration order.
    conditions: BTreeMap<u32, ConditionEntry>,

    /// Patch id to the memoized answer for this run.
    patch_values: HashMap<String, bool>,
    notified_patches: HashSet<String>,

    memo: BTreeMap<String, Payload>,
    search_attributes: BTreeMap<String, Payload>,
    current_details: String,

    active_handlers: u32,
    handlers_started: u64,
    handlers_finished: u64,

    commands: Vec<WorkflowCommand>,
    activation_failure: Option<TemporalFailure>,
    drained: bool,
    evicted: bool,
}

impl WorkflowMachine {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current_time: DateTime::UNIX_EPOCH,
            replaying: false,
            history_length: 0,
            history_size_bytes: 0,
            continue_as_new_suggested: false,
            rng: DeterministicRng::new(0),
            frozen: None,
            seqs: SeqCounters::default(),
            timers: HashMap::new(),
            activities: HashMap::new(),
            child_starts: HashMap::new(),
            child_results: HashMap::new(),
            external_signals: HashMap::new(),
            conditions: BTreeMap::new(),
            patch_values: HashMap::new(),
            notified_patches: HashSet::new(),
            memo: BTreeMap::new(),
            search_attributes: BTreeMap::new(),
            current_details: String::new(),
            active_handlers: 0,
            handlers_started: 0,
            handlers_finished: 0,
            commands: Vec::new(),
            activation_failure: None,
            drained: false,
            evicted: false,
        }
    }

    /// Absorb the initialize job: seed, memo, and search attributes.
    pub fn initialize(&mut self, init: &InitializeWorkflow) {
        self.rng.reseed(init.randomness_seed);
        self.memo = init.memo.clone();
        self.search_attributes = init.search_attributes.clone();
    }

    /// Update per-activation context before any job is applied.
    pub fn begin_activation(&mut self, activation: &WorkflowActivation) {
        self.current_time = activation.timestamp;
        self.replaying = activation.is_replaying;
        self.history_length = activation.history_length;
        self.history_size_bytes = activation.history_size_bytes;
        self.continue_as_new_suggested = activation.continue_as_new_suggested;
        self.drained = false;
    }

    // ── Reads: always permitted ──

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.current_time
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn history_length(&self) -> u32 {
        self.history_length
    }

    pub fn history_size_bytes(&self) -> u64 {
        self.history_size_bytes
    }

    pub fn continue_as_new_suggested(&self) -> bool {
        self.continue_as_new_suggested
    }

    pub fn current_details(&self) -> &str {
        &self.current_details
    }

    pub fn memo(&self) -> &BTreeMap<String, Payload> {
        &self.memo
    }

    pub fn search_attributes(&self) -> &BTreeMap<String, Payload> {
        &self.search_attributes
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    // ── Frozen contexts ──

    /// Make the author surface read-only. `context` names the phase for the
    /// error message; nesting is not supported.
    pub fn freeze(&mut self, context: &'static str) {
        self.frozen = Some(context);
    }

    pub fn thaw(&mut self) {
        self.frozen = None;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    fn ensure_mutable(&self, api: &'static str) -> Result<(), MachineError> {
        match self.frozen {
            Some(context) => Err(MachineError::FrozenContext { api, context }),
            None => Ok(()),
        }
    }

    // ── Randomness ──

    pub fn rng_mut(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    // ── Handler accounting ──

    pub fn handler_dispatched(&mut self) {
        self.active_handlers += 1;
        self.handlers_started += 1;
    }

    /// Must be called on every handler return path, success or not.
    pub fn handler_returned(&mut self) {
        debug_assert!(self.active_handlers > 0, "handler count underflow");
        self.active_handlers = self.active_handlers.saturating_sub(1);
        self.handlers_finished += 1;
    }

    pub fn active_handlers(&self) -> u32 {
        self.active_handlers
    }

    pub fn all_handlers_finished(&self) -> bool {
        self.active_handlers == 0
    }

    pub fn handler_counts(&self) -> (u64, u64) {
        (self.handlers_started, self.handlers_finished)
    }

    // ── Timers ──

    pub fn start_timer(
        &mut self,
        duration: Duration,
        summary: Option<String>,
    ) -> Result<(u32, ResumeToken<()>), MachineError> {
        self.ensure_mutable("sleep")?;
        let seq = bump(&mut self.seqs.timer);
        let (slot, token) = resume_pair();
        self.timers.insert(seq, slot);
        self.commands.push(WorkflowCommand::StartTimer(StartTimer {
            seq,
            duration,
            summary,
        }));
        Ok((seq, token))
    }

    /// Cancel a pending timer: emit the cancel and wake the waiter. A later
    /// fire job for the same seq is ignored.
    pub fn cancel_timer(&mut self, seq: u32) {
        if let Some(slot) = self.timers.remove(&seq) {
            self.commands.push(WorkflowCommand::CancelTimer { seq });
            slot.resolve(Woken::Cancelled);
        }
    }

    pub fn fire_timer(&mut self, seq: u32) {
        match self.timers.remove(&seq) {
            Some(slot) => slot.resolve(Woken::Resolved(())),
            None => debug!(run_id = %self.run_id, seq, "timer fired but is no longer pending"),
        }
    }

    // ── Activities ──

    pub fn schedule_activity(
        &mut self,
        mut attrs: ScheduleActivity,
    ) -> Result<(u32, ResumeToken<ActivityResolution>), MachineError> {
        self.ensure_mutable("execute_activity")?;
        let seq = bump(&mut self.seqs.activity);
        attrs.seq = seq;
        if attrs.activity_id.is_empty() {
            attrs.activity_id = seq.to_string();
        }
        let cancellation_type = attrs.cancellation_type;
        let (slot, token) = resume_pair();
        self.activities.insert(
            seq,
            PendingActivity {
                slot,
                is_local: false,
                cancellation_type,
                local_schedule: None,
            },
        );
        self.commands.push(WorkflowCommand::ScheduleActivity(attrs));
        Ok((seq, token))
    }

    pub fn schedule_local_activity(
        &mut self,
        mut attrs: ScheduleLocalActivity,
    ) -> Result<(u32, ResumeToken<ActivityResolution>), MachineError> {
        self.ensure_mutable("execute_local_activity")?;
        let seq = bump(&mut self.seqs.activity);
        attrs.seq = seq;
        if attrs.activity_id.is_empty() {
            attrs.activity_id = seq.to_string();
        }
        if attrs.attempt == 0 {
            attrs.attempt = 1;
        }
        let cancellation_type = attrs.cancellation_type;
        let (slot, token) = resume_pair();
        self.activities.insert(
            seq,
            PendingActivity {
                slot,
                is_local: true,
                cancellation_type,
                local_schedule: Some(Box::new(attrs.clone())),
            },
        );
        self.commands
            .push(WorkflowCommand::ScheduleLocalActivity(attrs));
        Ok((seq, token))
    }

    /// Ask the server to cancel a pending activity. Unless the activity was
    /// scheduled with the abandon cancellation type, the waiter stays parked
    /// until the server reports the final resolution.
    pub fn request_cancel_activity(&mut self, seq: u32) {
        let Some(pending) = self.activities.get(&seq) else {
            return;
        };
        match pending.cancellation_type {
            ActivityCancellationType::Abandon => {
                if let Some(pending) = self.activities.remove(&seq) {
                    pending.slot.resolve(Woken::Cancelled);
                }
            }
            _ => {
                let command = if pending.is_local {
                    WorkflowCommand::RequestCancelLocalActivity { seq }
                } else {
                    WorkflowCommand::RequestCancelActivity { seq }
                };
                self.commands.push(command);
            }
        }
    }

    pub fn resolve_activity(&mut self, seq: u32, resolution: ActivityResolution) {
        let Some(pending) = self.activities.remove(&seq) else {
            debug!(run_id = %self.run_id, seq, "activity resolved but is no longer pending");
            return;
        };
        if let ActivityResolution::Backoff {
            attempt,
            original_schedule_time,
            ..
        } = &resolution
        {
            if let Some(mut schedule) = pending.local_schedule {
                // Local retry: re-issue the schedule instead of waking the
                // waiter. The seq is unchanged so the next resolution still
                // correlates.
                schedule.attempt = *attempt;
                schedule.original_schedule_time = Some(*original_schedule_time);
                self.commands
                    .push(WorkflowCommand::ScheduleLocalActivity((*schedule).clone()));
                self.activities.insert(
                    seq,
                    PendingActivity {
                        slot: pending.slot,
                        is_local: true,
                        cancellation_type: pending.cancellation_type,
                        local_schedule: Some(schedule),
                    },
                );
                return;
            }
        }
        pending.slot.resolve(Woken::Resolved(resolution));
    }

    // ── Child workflows ──

    /// One sequence number covers the start and the result; the two tables
    /// are resolved by separate jobs.
    pub fn start_child_workflow(
        &mut self,
        mut attrs: StartChildWorkflowExecution,
    ) -> Result<
        (
            u32,
            ResumeToken<ChildWorkflowStartStatus>,
            ResumeToken<ChildWorkflowResult>,
        ),
        MachineError,
    > {
        self.ensure_mutable("start_child_workflow")?;
        let seq = bump(&mut self.seqs.child_workflow);
        attrs.seq = seq;
        let (start_slot, start_token) = resume_pair();
        let (result_slot, result_token) = resume_pair();
        self.child_starts.insert(
            seq,
            PendingChildStart {
                workflow_id: attrs.workflow_id.clone(),
                slot: start_slot,
            },
        );
        self.child_results.insert(
            seq,
            PendingChildResult {
                slot: result_slot,
                cancellation_type: attrs.cancellation_type,
            },
        );
        self.commands
            .push(WorkflowCommand::StartChildWorkflowExecution(attrs));
        Ok((seq, start_token, result_token))
    }

    pub fn child_workflow_id(&self, seq: u32) -> Option<&str> {
        self.child_starts
            .get(&seq)
            .map(|pending| pending.workflow_id.as_str())
    }

    pub fn cancel_child_workflow(&mut self, seq: u32) {
        let Some(pending) = self.child_results.get(&seq) else {
            return;
        };
        match pending.cancellation_type {
            ChildWorkflowCancellationType::Abandon => {
                if let Some(pending) = self.child_results.remove(&seq) {
                    pending.slot.resolve(Woken::Cancelled);
                }
            }
            _ => {
                self.commands
                    .push(WorkflowCommand::CancelChildWorkflowExecution {
                        child_workflow_seq: seq,
                    });
            }
        }
    }

    pub fn resolve_child_workflow_start(&mut self, seq: u32, status: ChildWorkflowStartStatus) {
        match self.child_starts.remove(&seq) {
            Some(pending) => {
                // A failed or cancelled start also settles the result table;
                // no result job will ever arrive.
                if !matches!(status, ChildWorkflowStartStatus::Succeeded { .. }) {
                    self.child_results.remove(&seq);
                }
                pending.slot.resolve(Woken::Resolved(status));
            }
            None => {
                debug!(run_id = %self.run_id, seq, "child start resolved but is no longer pending");
            }
        }
    }

    pub fn resolve_child_workflow_result(&mut self, seq: u32, result: ChildWorkflowResult) {
        match self.child_results.remove(&seq) {
            Some(pending) => pending.slot.resolve(Woken::Resolved(result)),
            None => {
                debug!(run_id = %self.run_id, seq, "child result resolved but is no longer pending");
            }
        }
    }

    // ── External signals ──

    pub fn signal_external_workflow(
        &mut self,
        mut attrs: SignalExternalWorkflowExecution,
    ) -> Result<(u32, ResumeToken<Option<TemporalFailure>>), MachineError> {
        self.ensure_mutable("signal_external_workflow")?;
        let seq = bump(&mut self.seqs.external_signal);
        attrs.seq = seq;
        let (slot, token) = resume_pair();
        self.external_signals.insert(seq, slot);
        self.commands
            .push(WorkflowCommand::SignalExternalWorkflowExecution(attrs));
        Ok((seq, token))
    }

    pub fn cancel_signal_external_workflow(&mut self, seq: u32) {
        if let Some(slot) = self.external_signals.remove(&seq) {
            self.commands
                .push(WorkflowCommand::CancelSignalWorkflow { seq });
            slot.resolve(Woken::Cancelled);
        }
    }

    pub fn resolve_signal_external_workflow(
        &mut self,
        seq: u32,
        failure: Option<TemporalFailure>,
    ) {
        match self.external_signals.remove(&seq) {
            Some(slot) => slot.resolve(Woken::Resolved(failure)),
            None => {
                debug!(run_id = %self.run_id, seq, "external signal resolved but is no longer pending");
            }
        }
    }

    // ── Conditions ──

    /// Register a wait predicate. Predicates must be pure; they are
    /// re-evaluated on every sweep until one is satisfied or the entry is
    /// cancelled.
    pub fn register_condition(
        &mut self,
        predicate: Rc<dyn Fn() -> bool>,
    ) -> Result<(u32, ResumeToken<()>), MachineError> {
        self.ensure_mutable("wait_condition")?;
        let seq = bump(&mut self.seqs.condition);
        let (slot, token) = resume_pair();
        self.conditions.insert(seq, ConditionEntry { predicate, slot });
        Ok((seq, token))
    }

    /// Registered condition seqs in insertion order.
    pub fn condition_seqs(&self) -> Vec<u32> {
        self.conditions.keys().copied().collect()
    }

    /// The predicate for `seq`, cloned out so the caller can evaluate it
    /// without holding a borrow of the machine.
    pub fn condition_predicate(&self, seq: u32) -> Option<Rc<dyn Fn() -> bool>> {
        self.conditions
            .get(&seq)
            .map(|entry| entry.predicate.clone())
    }

    /// Wake the waiter for a satisfied condition and drop the entry.
    pub fn resolve_condition(&mut self, seq: u32) {
        if let Some(entry) = self.conditions.remove(&seq) {
            entry.slot.resolve(Woken::Resolved(()));
        }
    }

    pub fn cancel_condition(&mut self, seq: u32) {
        if let Some(entry) = self.conditions.remove(&seq) {
            entry.slot.resolve(Woken::Cancelled);
        }
    }

    // ── Patches ──

    /// Memoized per id: the first call fixes the answer for the whole run.
    /// When the answer is true, exactly one patch marker is recorded.
    pub fn patch(&mut self, id: &str, deprecated: bool) -> Result<bool, MachineError> {
        self.ensure_mutable("patch")?;
        if let Some(&value) = self.patch_values.get(id) {
            return Ok(value);
        }
        let value = !self.replaying || self.notified_patches.contains(id);
        self.patch_values.insert(id.to_string(), value);
        if value {
            self.commands.push(WorkflowCommand::SetPatchMarker {
                patch_id: id.to_string(),
                deprecated,
            });
        }
        Ok(value)
    }

    pub fn notify_has_patch(&mut self, id: &str) {
        self.notified_patches.insert(id.to_string());
    }

    // ── Memo and search attributes ──

    pub fn upsert_search_attributes(
        &mut self,
        delta: BTreeMap<String, Payload>,
    ) -> Result<(), MachineError> {
        self.ensure_mutable("upsert_search_attributes")?;
        for (key, value) in &delta {
            self.search_attributes.insert(key.clone(), value.clone());
        }
        self.commands
            .push(WorkflowCommand::UpsertWorkflowSearchAttributes {
                search_attributes: delta,
            });
        Ok(())
    }

    /// Patch the memo; `None` values delete their key.
    pub fn upsert_memo(
        &mut self,
        delta: BTreeMap<String, Option<Payload>>,
    ) -> Result<(), MachineError> {
        self.ensure_mutable("upsert_memo")?;
        for (key, value) in &delta {
            match value {
                Some(payload) => {
                    self.memo.insert(key.clone(), payload.clone());
                }
                None => {
                    self.memo.remove(key);
                }
            }
        }
        self.commands
            .push(WorkflowCommand::ModifyWorkflowProperties {
                upserted_memo: delta,
            });
        Ok(())
    }

    pub fn set_current_details(&mut self, details: String) -> Result<(), MachineError> {
        self.ensure_mutable("set_current_details")?;
        self.current_details = details;
        Ok(())
    }

    // ── Run finalizers ──

    pub fn continue_as_new(&mut self, attrs: ContinueAsNewWorkflowExecution) {
        debug_assert!(self.frozen.is_none());
        self.commands
            .push(WorkflowCommand::ContinueAsNewWorkflowExecution(attrs));
    }

    pub fn workflow_completed(&mut self, result: Option<Payload>) {
        debug_assert!(self.frozen.is_none());
        self.commands
            .push(WorkflowCommand::CompleteWorkflowExecution { result });
    }

    pub fn workflow_failed(&mut self, failure: TemporalFailure) {
        debug_assert!(self.frozen.is_none());
        self.commands
            .push(WorkflowCommand::FailWorkflowExecution { failure });
    }

    /// The run observed its cancellation and unwound cleanly.
    pub fn workflow_cancellation_acknowledged(&mut self) {
        debug_assert!(self.frozen.is_none());
        self.commands.push(WorkflowCommand::CancelWorkflowExecution);
    }

    /// Record a workflow task failure. The first failure wins and overrides
    /// the command batch at drain time.
    pub fn workflow_task_failed(&mut self, failure: TemporalFailure) {
        if self.activation_failure.is_none() {
            self.activation_failure = Some(failure);
        } else {
            debug!(run_id = %self.run_id, %failure, "secondary workflow task failure dropped");
        }
    }

    // ── Output ──

    pub fn append_command(&mut self, command: WorkflowCommand) {
        self.commands.push(command);
    }

    /// Flush the activation's output. Called exactly once per activation;
    /// a pending task failure takes precedence over the command batch.
    pub fn drain_commands(&mut self) -> Result<ActivationOutcome, MachineError> {
        if self.drained {
            return Err(MachineError::AlreadyDrained);
        }
        self.drained = true;
        if let Some(failure) = self.activation_failure.take() {
            self.commands.clear();
            return Ok(ActivationOutcome::FailActivation(failure));
        }
        Ok(ActivationOutcome::SendCommands(std::mem::take(
            &mut self.commands,
        )))
    }

    // ── Eviction ──

    /// Force-wake every outstanding waiter with `Evicted` and discard any
    /// output. After this the machine accepts no further jobs.
    pub fn evict(&mut self) {
        self.evicted = true;
        for (_, slot) in self.timers.drain() {
            slot.resolve(Woken::Evicted);
        }
        for (_, pending) in self.activities.drain() {
            pending.slot.resolve(Woken::Evicted);
        }
        for (_, pending) in self.child_starts.drain() {
            pending.slot.resolve(Woken::Evicted);
        }
        for (_, pending) in self.child_results.drain() {
            pending.slot.resolve(Woken::Evicted);
        }
        for (_, slot) in self.external_signals.drain() {
            slot.resolve(Woken::Evicted);
        }
        let conditions = std::mem::take(&mut self.conditions);
        for (_, entry) in conditions {
            entry.slot.resolve(Woken::Evicted);
        }
        self.commands.clear();
        self.activation_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_types::payload::{ENCODING_JSON, Payload};
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll, Waker};

    fn poll_token<T>(token: &mut ResumeToken<T>) -> Poll<Woken<T>> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(token).poll(&mut cx)
    }

    fn machine() -> WorkflowMachine {
        WorkflowMachine::new("run-1")
    }

    fn replaying_machine() -> WorkflowMachine {
        let mut m = machine();
        m.begin_activation(&WorkflowActivation {
            run_id: "run-1".into(),
            timestamp: DateTime::UNIX_EPOCH,
            is_replaying: true,
            history_length: 10,
            history_size_bytes: 100,
            continue_as_new_suggested: false,
            jobs: vec![],
        });
        m
    }

    fn schedule_attrs() -> ScheduleActivity {
        ScheduleActivity {
            seq: 0,
            activity_id: String::new(),
            activity_type: "A".into(),
            task_queue: None,
            headers: BTreeMap::new(),
            arguments: vec![],
            schedule_to_close_timeout: Some(Duration::from_secs(30)),
            schedule_to_start_timeout: None,
            start_to_close_timeout: None,
            heartbeat_timeout: None,
            retry_policy: None,
            cancellation_type: ActivityCancellationType::TryCancel,
        }
    }

    fn local_attrs() -> ScheduleLocalActivity {
        ScheduleLocalActivity {
            seq: 0,
            activity_id: String::new(),
            activity_type: "L".into(),
            headers: BTreeMap::new(),
            arguments: vec![],
            schedule_to_close_timeout: Some(Duration::from_secs(30)),
            start_to_close_timeout: None,
            retry_policy: None,
            attempt: 0,
            original_schedule_time: None,
            cancellation_type: ActivityCancellationType::TryCancel,
        }
    }

    #[test]
    fn sequence_counters_are_independent_and_monotonic() {
        let mut m = machine();
        let (t0, _tok0) = m.start_timer(Duration::from_secs(1), None).unwrap();
        let (t1, _tok1) = m.start_timer(Duration::from_secs(1), None).unwrap();
        let (a0, _atok) = m.schedule_activity(schedule_attrs()).unwrap();
        assert_eq!((t0, t1), (0, 1));
        assert_eq!(a0, 0);
    }

    #[test]
    fn timer_fire_resumes_waiter() {
        let mut m = machine();
        let (seq, mut token) = m.start_timer(Duration::from_secs(5), None).unwrap();
        assert!(poll_token(&mut token).is_pending());
        m.fire_timer(seq);
        assert_eq!(poll_token(&mut token), Poll::Ready(Woken::Resolved(())));
        match m.drain_commands().unwrap() {
            ActivationOutcome::SendCommands(commands) => {
                assert_eq!(commands.len(), 1);
                assert_eq!(commands[0].name(), "StartTimer");
            }
            ActivationOutcome::FailActivation(f) => panic!("unexpected failure: {f}"),
        }
    }

    #[test_log::test]
    fn timer_cancel_then_fire_wakes_exactly_once() {
        let mut m = machine();
        let (seq, mut token) = m.start_timer(Duration::from_secs(5), None).unwrap();
        m.cancel_timer(seq);
        // The bridge may still deliver the fire for the same seq.
        m.fire_timer(seq);
        assert_eq!(poll_token(&mut token), Poll::Ready(Woken::<()>::Cancelled));
        assert!(poll_token(&mut token).is_pending());
        let ActivationOutcome::SendCommands(commands) = m.drain_commands().unwrap() else {
            panic!("expected commands");
        };
        let names: Vec<_> = commands.iter().map(|c| c.name()).collect();
        similar_asserts::assert_eq!(names, vec!["StartTimer", "CancelTimer"]);
    }

    #[test]
    fn frozen_context_rejects_mutation_and_allows_reads() {
        let mut m = machine();
        m.freeze("a query handler is running");
        let err = m.start_timer(Duration::from_secs(1), None).unwrap_err();
        assert_eq!(
            err,
            MachineError::FrozenContext {
                api: "sleep",
                context: "a query handler is running",
            }
        );
        assert!(m.patch("p", false).is_err());
        assert!(m.upsert_memo(BTreeMap::new()).is_err());
        let _ = m.now();
        let _ = m.memo();
        assert!(m.is_frozen());
        m.thaw();
        assert!(m.start_timer(Duration::from_secs(1), None).is_ok());
    }

    #[test]
    fn patch_is_memoized_and_marker_emitted_once() {
        let mut m = machine();
        assert!(m.patch("p1", false).unwrap());
        assert!(m.patch("p1", false).unwrap());
        let ActivationOutcome::SendCommands(commands) = m.drain_commands().unwrap() else {
            panic!("expected commands");
        };
        let markers = commands
            .iter()
            .filter(|c| matches!(c, WorkflowCommand::SetPatchMarker { .. }))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn patch_during_replay_depends_on_notification() {
        let mut m = replaying_machine();
        assert!(!m.patch("cold", false).unwrap());
        m.notify_has_patch("hot");
        assert!(m.patch("hot", false).unwrap());
        // Memoized: the cold answer does not flip even after a notify.
        m.notify_has_patch("cold");
        assert!(!m.patch("cold", false).unwrap());
    }

    #[test_log::test]
    fn local_activity_backoff_reschedules_without_waking() {
        let mut m = machine();
        let (seq, mut token) = m.schedule_local_activity(local_attrs()).unwrap();
        m.resolve_activity(
            seq,
            ActivityResolution::Backoff {
                attempt: 3,
                backoff_duration: Duration::from_secs(10),
                original_schedule_time: DateTime::UNIX_EPOCH,
            },
        );
        assert!(poll_token(&mut token).is_pending());
        let ActivationOutcome::SendCommands(commands) = m.drain_commands().unwrap() else {
            panic!("expected commands");
        };
        let schedules: Vec<&ScheduleLocalActivity> = commands
            .iter()
            .filter_map(|c| match c {
                WorkflowCommand::ScheduleLocalActivity(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(schedules.len(), 2);
        assert_eq!(schedules[0].attempt, 1);
        assert_eq!(schedules[1].attempt, 3);
        assert_eq!(schedules[1].seq, seq);
        assert!(schedules[1].original_schedule_time.is_some());
        // The real resolution still lands.
        m.resolve_activity(seq, ActivityResolution::Completed { result: None });
        assert_eq!(
            poll_token(&mut token),
            Poll::Ready(Woken::Resolved(ActivityResolution::Completed {
                result: None
            }))
        );
    }

    #[test]
    fn abandoned_activity_cancel_resolves_locally_without_command() {
        let mut m = machine();
        let mut attrs = schedule_attrs();
        attrs.cancellation_type = ActivityCancellationType::Abandon;
        let (seq, mut token) = m.schedule_activity(attrs).unwrap();
        m.request_cancel_activity(seq);
        assert_eq!(
            poll_token(&mut token),
            Poll::Ready(Woken::<ActivityResolution>::Cancelled)
        );
        let ActivationOutcome::SendCommands(commands) = m.drain_commands().unwrap() else {
            panic!("expected commands");
        };
        assert!(
            !commands
                .iter()
                .any(|c| matches!(c, WorkflowCommand::RequestCancelActivity { .. }))
        );
    }

    #[test]
    fn failed_child_start_settles_both_tables() {
        let mut m = machine();
        let attrs = StartChildWorkflowExecution {
            seq: 0,
            workflow_id: "child-1".into(),
            workflow_type: "Child".into(),
            task_queue: None,
            input: vec![],
            headers: BTreeMap::new(),
            memo: BTreeMap::new(),
            search_attributes: BTreeMap::new(),
            workflow_execution_timeout: None,
            workflow_run_timeout: None,
            workflow_task_timeout: None,
            parent_close_policy: Default::default(),
            workflow_id_reuse_policy: Default::default(),
            retry_policy: None,
            cron_schedule: None,
            cancellation_type: Default::default(),
        };
        let (seq, mut start, mut result) = m.start_child_workflow(attrs).unwrap();
        assert_eq!(m.child_workflow_id(seq), Some("child-1"));
        m.resolve_child_workflow_start(
            seq,
            ChildWorkflowStartStatus::AlreadyExists {
                workflow_id: "child-1".into(),
                workflow_type: "Child".into(),
            },
        );
        assert!(poll_token(&mut start).is_ready());
        // No result job will arrive; the result table entry is gone.
        m.resolve_child_workflow_result(seq, ChildWorkflowResult::Completed { result: None });
        assert!(poll_token(&mut result).is_pending());
    }

    #[test]
    fn memo_upsert_merges_and_deletes() {
        let mut m = machine();
        let p = |s: &str| Payload::new(ENCODING_JSON, s.as_bytes().to_vec());
        m.upsert_memo(BTreeMap::from([
            ("a".to_string(), Some(p("1"))),
            ("b".to_string(), Some(p("2"))),
        ]))
        .unwrap();
        m.upsert_memo(BTreeMap::from([
            ("a".to_string(), None),
            ("c".to_string(), Some(p("3"))),
        ]))
        .unwrap();
        assert!(!m.memo().contains_key("a"));
        assert_eq!(m.memo().get("b"), Some(&p("2")));
        assert_eq!(m.memo().get("c"), Some(&p("3")));
    }

    #[test]
    fn task_failure_overrides_commands_and_drain_is_single_shot() {
        let mut m = machine();
        m.start_timer(Duration::from_secs(1), None).unwrap();
        m.workflow_task_failed(TemporalFailure::application("boom", "Bug"));
        match m.drain_commands().unwrap() {
            ActivationOutcome::FailActivation(failure) => {
                assert_eq!(failure.message, "boom");
            }
            ActivationOutcome::SendCommands(_) => panic!("expected failure"),
        }
        assert_eq!(m.drain_commands().unwrap_err(), MachineError::AlreadyDrained);
        // The buffer was discarded along with the failed activation.
        m.begin_activation(&WorkflowActivation {
            run_id: "run-1".into(),
            timestamp: DateTime::UNIX_EPOCH,
            is_replaying: false,
            history_length: 0,
            history_size_bytes: 0,
            continue_as_new_suggested: false,
            jobs: vec![],
        });
        let ActivationOutcome::SendCommands(commands) = m.drain_commands().unwrap() else {
            panic!("expected commands");
        };
        assert!(commands.is_empty());
    }

    #[test]
    fn handler_accounting_balances() {
        let mut m = machine();
        assert!(m.all_handlers_finished());
        m.handler_dispatched();
        m.handler_dispatched();
        assert_eq!(m.active_handlers(), 2);
        m.handler_returned();
        assert!(!m.all_handlers_finished());
        m.handler_returned();
        assert!(m.all_handlers_finished());
        assert_eq!(m.handler_counts(), (2, 2));
    }

    #[test]
    fn eviction_wakes_every_waiter() {
        let mut m = machine();
        let (_t, mut timer_tok) = m.start_timer(Duration::from_secs(1), None).unwrap();
        let (_a, mut act_tok) = m.schedule_activity(schedule_attrs()).unwrap();
        let (_c, mut cond_tok) = m.register_condition(Rc::new(|| false)).unwrap();
        m.evict();
        assert_eq!(poll_token(&mut timer_tok), Poll::Ready(Woken::<()>::Evicted));
        assert_eq!(
            poll_token(&mut act_tok),
            Poll::Ready(Woken::<ActivityResolution>::Evicted)
        );
        assert_eq!(poll_token(&mut cond_tok), Poll::Ready(Woken::<()>::Evicted));
        assert!(m.is_evicted());
        assert!(m.condition_seqs().is_empty());
    }

    #[test]
    fn conditions_iterate_in_registration_order() {
        let mut m = machine();
        let (s0, _t0) = m.register_condition(Rc::new(|| false)).unwrap();
        let (s1, _t1) = m.register_condition(Rc::new(|| true)).unwrap();
        let (s2, _t2) = m.register_condition(Rc::new(|| true)).unwrap();
        assert_eq!(m.condition_seqs(), vec![s0, s1, s2]);
        let satisfied = m
            .condition_seqs()
            .into_iter()
            .find(|&seq| m.condition_predicate(seq).is_some_and(|p| p()));
        assert_eq!(satisfied, Some(s1));
    }
}
