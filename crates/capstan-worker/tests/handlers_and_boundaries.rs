//! Handler dispatch, patches, metadata, and boundary behaviors.

mod common;

use common::*;

use capstan_types::activation::ActivationJob;
use capstan_types::command::{
    QueryResult, QueryResultVariant, UpdateResponse, UpdateResponseVariant, WorkflowCommand,
};
use capstan_types::options::ActivityOptions;
use capstan_types::payload::Payload;
use capstan_worker::error::{ApplicationError, WorkflowError};
use capstan_worker::registry::{METADATA_QUERY_TYPE, WorkflowRegistration};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;

fn parked() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("Parked")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            ctx.wait_condition(|| false).await?;
            Ok(())
        })
        .build()
        .expect("valid registration")
}

// ── Updates ──

struct Greeter {
    greeting: RefCell<String>,
}

fn greeter() -> WorkflowRegistration {
    WorkflowRegistration::builder::<Greeter>("Greeter")
        .init(|_: ()| Greeter {
            greeting: RefCell::new("hello".to_string()),
        })
        .run(|_wf, ctx| async move {
            ctx.wait_condition(|| false).await?;
            Ok(())
        })
        .update_with_validator(
            "set-greeting",
            |_wf, _ctx, input: String| {
                if input.is_empty() {
                    Err(WorkflowError::Application(ApplicationError::new(
                        "greeting must not be empty",
                        "ValidationError",
                    )))
                } else {
                    Ok(())
                }
            },
            |wf, _ctx, input: String| async move {
                let previous = wf.greeting.replace(input);
                Ok(previous)
            },
        )
        .build()
        .expect("valid registration")
}

fn update_job(id: &str, name: &str, input: Vec<Payload>, run_validator: bool) -> ActivationJob {
    ActivationJob::DoUpdate {
        id: id.to_string(),
        name: name.to_string(),
        input,
        headers: BTreeMap::new(),
        run_validator,
    }
}

fn update_responses(commands: &[WorkflowCommand]) -> Vec<&UpdateResponse> {
    commands
        .iter()
        .filter_map(|command| match command {
            WorkflowCommand::UpdateResponse(response) => Some(response),
            _ => None,
        })
        .collect()
}

#[test]
fn accepted_update_runs_and_completes() {
    let mut instance = instance_for(greeter(), "run-upd");
    commands_of(instance.activate(activation("run-upd", 1, vec![init_job("Greeter", vec![])])));

    let commands = commands_of(instance.activate(activation(
        "run-upd",
        2,
        vec![update_job("u1", "set-greeting", vec![json_payload(&"hi")], true)],
    )));
    let responses = update_responses(&commands);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].protocol_instance_id, "u1");
    assert!(matches!(responses[0].response, UpdateResponseVariant::Accepted));
    match &responses[1].response {
        UpdateResponseVariant::Completed { result } => {
            assert_eq!(result.clone(), Some(json_payload(&"hello")));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn failing_validator_rejects_without_running_the_handler() {
    let mut instance = instance_for(greeter(), "run-upd-rej");
    commands_of(instance.activate(activation(
        "run-upd-rej",
        1,
        vec![init_job("Greeter", vec![])],
    )));

    let commands = commands_of(instance.activate(activation(
        "run-upd-rej",
        2,
        vec![update_job("u2", "set-greeting", vec![json_payload(&"")], true)],
    )));
    let responses = update_responses(&commands);
    assert_eq!(responses.len(), 1);
    match &responses[0].response {
        UpdateResponseVariant::Rejected { failure } => {
            assert_eq!(failure.message, "greeting must not be empty");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn unknown_update_fails_the_workflow_task() {
    let mut instance = instance_for(greeter(), "run-upd-missing");
    commands_of(instance.activate(activation(
        "run-upd-missing",
        1,
        vec![init_job("Greeter", vec![])],
    )));

    let message = failure_of(instance.activate(activation(
        "run-upd-missing",
        2,
        vec![update_job("u3", "no-such-update", vec![], false)],
    )));
    assert!(message.contains("no-such-update"));
    assert!(message.contains("set-greeting"));
}

// ── Queries and signals: boundaries ──

fn stateful_queries() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("StatefulQueries")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            ctx.wait_condition(|| false).await?;
            Ok(())
        })
        .query("beta", |_wf, _ctx, _: ()| Ok("b".to_string()))
        .query("alpha", |_wf, _ctx, _: ()| Ok("a".to_string()))
        .query("frozen-probe", |_wf, ctx, _: ()| {
            ctx.patch("illegal")?;
            Ok("unreachable".to_string())
        })
        .build()
        .expect("valid registration")
}

fn query_job(id: &str, query_type: &str) -> ActivationJob {
    ActivationJob::QueryWorkflow {
        query_id: id.to_string(),
        query_type: query_type.to_string(),
        arguments: vec![],
        headers: BTreeMap::new(),
    }
}

#[test]
fn unknown_query_fails_the_task_listing_known_queries_sorted() {
    let mut instance = instance_for(stateful_queries(), "run-q");
    commands_of(instance.activate(activation(
        "run-q",
        1,
        vec![init_job("StatefulQueries", vec![])],
    )));

    let message = failure_of(instance.activate(activation(
        "run-q",
        2,
        vec![query_job("q1", "no-such-query")],
    )));
    assert!(message.contains("no-such-query"));
    assert!(message.contains("alpha, beta, frozen-probe"));
}

#[test]
fn mutation_inside_a_query_handler_fails_the_activation() {
    let mut instance = instance_for(stateful_queries(), "run-q-frozen");
    commands_of(instance.activate(activation(
        "run-q-frozen",
        1,
        vec![init_job("StatefulQueries", vec![])],
    )));

    let message = failure_of(instance.activate(activation(
        "run-q-frozen",
        2,
        vec![query_job("q1", "frozen-probe")],
    )));
    assert!(message.contains("`patch` is not allowed while a query handler is running"));
}

#[test]
fn unknown_signal_is_dropped_not_failed() {
    let mut instance = instance_for(parked(), "run-sig");
    commands_of(instance.activate(activation("run-sig", 1, vec![init_job("Parked", vec![])])));

    let commands = commands_of(instance.activate(activation(
        "run-sig",
        2,
        vec![ActivationJob::SignalWorkflow {
            signal_name: "nobody-home".into(),
            input: vec![],
            headers: BTreeMap::new(),
        }],
    )));
    assert!(commands.is_empty());
}

#[test]
fn first_activation_without_initialize_fails() {
    let mut instance = instance_for(parked(), "run-noinit");
    let message = failure_of(instance.activate(activation(
        "run-noinit",
        1,
        vec![ActivationJob::FireTimer { seq: 0 }],
    )));
    assert!(message.contains("expected InitializeWorkflow"));
}

// ── Built-in metadata query ──

fn described() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("Described")
        .description("demonstrates the metadata query")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            ctx.set_current_details("phase: waiting")?;
            ctx.wait_condition(|| false).await?;
            Ok(())
        })
        .signal("zulu", |_wf, _ctx, _: ()| async move { Ok(()) })
        .signal_described("alpha", Some("first"), |_wf, _ctx, _: ()| async move {
            Ok(())
        })
        .query("zeta", |_wf, _ctx, _: ()| Ok(0u32))
        .query("eta", |_wf, _ctx, _: ()| Ok(0u32))
        .build()
        .expect("valid registration")
}

#[test]
fn metadata_query_lists_sorted_definitions_and_details() {
    let mut instance = instance_for(described(), "run-meta");
    let commands = commands_of(instance.activate(activation(
        "run-meta",
        1,
        vec![
            init_job("Described", vec![]),
            query_job("meta", METADATA_QUERY_TYPE),
        ],
    )));
    let response = commands
        .iter()
        .find_map(|command| match command {
            WorkflowCommand::RespondToQuery(QueryResult {
                query_id,
                variant: QueryResultVariant::Succeeded { response },
            }) if query_id == "meta" => Some(response.clone()),
            _ => None,
        })
        .expect("metadata response")
        .expect("metadata payload");

    let metadata: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(metadata["definition"]["type"], "Described");
    let signal_names: Vec<&str> = metadata["definition"]["signal_definitions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(signal_names, vec!["alpha", "zulu"]);
    let query_names: Vec<&str> = metadata["definition"]["query_definitions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(query_names, vec!["eta", "zeta"]);
    assert_eq!(metadata["current_details"], "phase: waiting");
}

// ── Patches ──

fn patched() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("Patched")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            let name = if ctx.patch("p1")? {
                "PostPatch"
            } else {
                "PrePatch"
            };
            let _: () = ctx
                .execute_activity(
                    name,
                    (),
                    ActivityOptions {
                        start_to_close_timeout: Some(Duration::from_secs(10)),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(())
        })
        .build()
        .expect("valid registration")
}

fn scheduled_activity_type(commands: &[WorkflowCommand]) -> String {
    commands
        .iter()
        .find_map(|command| match command {
            WorkflowCommand::ScheduleActivity(activity) => Some(activity.activity_type.clone()),
            _ => None,
        })
        .expect("an activity was scheduled")
}

#[test]
fn fresh_run_takes_the_patched_branch_and_records_the_marker() {
    let mut instance = instance_for(patched(), "run-patch-new");
    let commands = commands_of(instance.activate(activation(
        "run-patch-new",
        1,
        vec![init_job("Patched", vec![])],
    )));
    assert_eq!(
        command_names(&commands),
        vec!["SetPatchMarker", "ScheduleActivity"]
    );
    assert_eq!(scheduled_activity_type(&commands), "PostPatch");
}

#[test]
fn replay_without_notification_takes_the_old_branch() {
    let mut instance = instance_for(patched(), "run-patch-old");
    let commands = commands_of(instance.activate(replaying_activation(
        "run-patch-old",
        1,
        vec![init_job("Patched", vec![])],
    )));
    assert_eq!(command_names(&commands), vec!["ScheduleActivity"]);
    assert_eq!(scheduled_activity_type(&commands), "PrePatch");
}

#[test]
fn replay_with_notification_takes_the_patched_branch() {
    let mut instance = instance_for(patched(), "run-patch-notified");
    let commands = commands_of(instance.activate(replaying_activation(
        "run-patch-notified",
        1,
        vec![
            init_job("Patched", vec![]),
            ActivationJob::NotifyHasPatch {
                patch_id: "p1".into(),
            },
        ],
    )));
    assert_eq!(
        command_names(&commands),
        vec!["SetPatchMarker", "ScheduleActivity"]
    );
    assert_eq!(scheduled_activity_type(&commands), "PostPatch");
}

// ── Memo and search attributes ──

fn annotator() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("Annotator")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            ctx.upsert_memo(BTreeMap::from([
                ("progress".to_string(), Some(1u32)),
                ("stale".to_string(), None),
            ]))?;
            ctx.upsert_search_attributes(BTreeMap::from([(
                "CustomKeyword".to_string(),
                "indexed".to_string(),
            )]))?;
            let progress: Option<u32> = ctx.memo("progress")?;
            Ok(progress)
        })
        .build()
        .expect("valid registration")
}

#[test]
fn memo_and_search_attribute_upserts_emit_commands_and_apply_locally() {
    let memo = BTreeMap::from([
        ("progress".to_string(), json_payload(&0u32)),
        ("stale".to_string(), json_payload(&"old")),
    ]);
    let mut instance = instance_for(annotator(), "run-memo");
    let commands = commands_of(instance.activate(activation(
        "run-memo",
        1,
        vec![init_job_with_memo("Annotator", vec![], memo)],
    )));
    assert_eq!(
        command_names(&commands),
        vec![
            "ModifyWorkflowProperties",
            "UpsertWorkflowSearchAttributes",
            "CompleteWorkflowExecution",
        ]
    );
    match &commands[0] {
        WorkflowCommand::ModifyWorkflowProperties { upserted_memo } => {
            assert_eq!(upserted_memo.get("progress"), Some(&Some(json_payload(&1u32))));
            assert_eq!(upserted_memo.get("stale"), Some(&None));
        }
        other => panic!("expected ModifyWorkflowProperties, got {other:?}"),
    }
    match &commands[2] {
        WorkflowCommand::CompleteWorkflowExecution { result } => {
            // The run read back the memo it just upserted.
            assert_eq!(result.clone(), Some(json_payload(&1u32)));
        }
        other => panic!("expected CompleteWorkflowExecution, got {other:?}"),
    }
}

// ── Eviction ──

#[test]
fn remove_from_cache_completes_empty_and_parks_the_instance() {
    let mut instance = instance_for(canceling_sleeper(), "run-evict");
    let commands = commands_of(instance.activate(activation(
        "run-evict",
        1,
        vec![init_job("Sleeper", vec![])],
    )));
    assert_eq!(command_names(&commands), vec!["StartTimer"]);

    let commands = commands_of(instance.activate(activation(
        "run-evict",
        2,
        vec![ActivationJob::RemoveFromCache {
            message: "cache full".into(),
        }],
    )));
    assert!(commands.is_empty());

    // The evicted instance ignores further activations.
    let commands = commands_of(instance.activate(activation(
        "run-evict",
        3,
        vec![ActivationJob::FireTimer { seq: 0 }],
    )));
    assert!(commands.is_empty());
}

fn canceling_sleeper() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("Sleeper")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            ctx.sleep(Duration::from_secs(120)).await?;
            Ok(())
        })
        .build()
        .expect("valid registration")
}

// ── Deterministic randomness ──

fn random_reporter() -> WorkflowRegistration {
    WorkflowRegistration::builder::<()>("RandomReporter")
        .init(|_: ()| ())
        .run(|_wf, ctx| async move {
            let values = vec![ctx.random(), ctx.random()];
            let id = ctx.uuid4().to_string();
            Ok((values, id))
        })
        .build()
        .expect("valid registration")
}

#[test]
fn random_values_are_stable_across_instances_with_the_same_seed() {
    let drive = |run_id: &str| {
        let mut instance = instance_for(random_reporter(), run_id);
        commands_of(instance.activate(activation(
            run_id,
            1,
            vec![init_job("RandomReporter", vec![])],
        )))
    };
    similar_asserts::assert_eq!(drive("run-rng"), drive("run-rng"));
}
