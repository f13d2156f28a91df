mod common;

use std::sync::Arc;

use common::{AfterBatches, ScriptedModel, TableSearch, hit, test_config};
use research_core::{
    ConfigLoader, ConversationMessage, ResearchTarget, StopReason, Topic, build_controller,
};
use tokio_util::sync::CancellationToken;

fn tool_results(messages: &[ConversationMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|message| match message {
            ConversationMessage::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn iteration_limit_bounds_planner_and_search_calls() {
    let config = test_config(3);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme funding"]],
        AfterBatches::RepeatLast,
    ));
    let search = Arc::new(TableSearch::new().with(
        "Acme funding",
        vec![hit("https://acme.io/funding", "Acme raises", "Series B")],
    ));
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("run should finish");

    assert_eq!(outcome.stop_reason, StopReason::IterationLimit);
    assert_eq!(outcome.state.iteration(), 3);
    assert_eq!(model.planner_calls(), 4);

    let requests = search.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert!(request.query.starts_with("Acme funding "));
        assert_eq!(request.topic, Topic::News);
        assert_eq!(request.days, Some(3));
    }

    let results = tool_results(outcome.state.conversation());
    assert_eq!(results.len(), 3);
    assert!(results[0].contains("Acme raises: https://acme.io/funding"));
    assert_eq!(results[1], "No new documents were found.");
    assert_eq!(outcome.state.collected.len(), 1);
}

#[tokio::test]
async fn failing_searches_still_advance_the_loop() {
    let config = test_config(5);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["fail one", "fail two"], vec!["fail three"]],
        AfterBatches::Complete,
    ));
    let search = Arc::new(TableSearch::new());
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("search failures are not fatal");

    assert_eq!(outcome.stop_reason, StopReason::PlannerComplete);
    assert_eq!(outcome.state.iteration(), 2);
    assert_eq!(model.planner_calls(), 3);
    assert_eq!(search.requests().len(), 3);
    assert!(outcome.state.collected.is_empty());
    assert!(outcome.state.curated.is_empty());
    assert_eq!(search.extract_calls(), 0);
}

#[tokio::test]
async fn overlapping_batches_keep_one_record_per_identity() {
    let config = test_config(5);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3"], vec!["Acme press"]],
        AfterBatches::Complete,
    ));
    let mut enriched = hit("https://acme.io/q3/", "Acme Q3 results", "Revenue up");
    enriched.raw_content = Some("Full Q3 text".to_string());
    let search = Arc::new(
        TableSearch::new()
            .with(
                "Acme q3",
                vec![
                    hit("https://acme.io/q3", "Acme Q3 results", "Revenue up"),
                    hit("https://news.io/acme", "Acme in the news", "Deal"),
                ],
            )
            .with(
                "Acme press",
                vec![
                    enriched,
                    hit("https://blog.io/acme#comments", "Acme blog", "Launch"),
                ],
            ),
    );
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("run should finish");

    let collected: Vec<_> = outcome.state.collected.urls().collect();
    assert_eq!(
        collected,
        vec![
            "https://acme.io/q3",
            "https://news.io/acme",
            "https://blog.io/acme"
        ]
    );
    let q3 = outcome
        .state
        .collected
        .get("https://acme.io/q3")
        .expect("q3 collected");
    assert_eq!(q3.raw_content.as_deref(), Some("Full Q3 text"));

    let results = tool_results(outcome.state.conversation());
    assert!(!results[1].contains("acme.io/q3"));
    assert!(results[1].contains("https://blog.io/acme"));

    // Ranking reply is not JSON, so every collected document is curated.
    assert!(outcome.curation.ranking_fallback);
    assert_eq!(outcome.state.curated.len(), 3);
    let news = outcome
        .state
        .curated
        .get("https://news.io/acme")
        .expect("news curated");
    assert_eq!(
        news.raw_content.as_deref(),
        Some("full text of https://news.io/acme")
    );
}

#[tokio::test]
async fn excluded_documents_are_never_curated() {
    let config = test_config(5);
    let model = Arc::new(
        ScriptedModel::new(vec![vec!["Acme q3"]], AfterBatches::Complete).with_ranking(
            r#"```json
            {"documents": [
                {"url": "https://acme.io/careers", "relevance": 0.99},
                {"url": "https://acme.io/q3", "relevance": 0.5}
            ]}
            ```"#,
        ),
    );
    let search = Arc::new(TableSearch::new().with(
        "Acme q3",
        vec![
            hit("https://acme.io/careers", "Jobs at Acme", "We are hiring"),
            hit("https://acme.io/q3", "Acme Q3 results", "Revenue up"),
        ],
    ));
    let (controller, _) = build_controller(&config, model.clone(), search.clone());
    let target = ResearchTarget::new("Acme").with_exclusions(["Careers"]);

    let outcome = controller
        .run(target, &CancellationToken::new())
        .await
        .expect("run should finish");

    assert_eq!(outcome.state.collected.len(), 2);
    assert!(!outcome.curation.ranking_fallback);
    let curated: Vec<_> = outcome.state.curated.urls().collect();
    assert_eq!(curated, vec!["https://acme.io/q3"]);
}

#[tokio::test]
async fn planner_failure_moves_to_curation() {
    let config = test_config(5);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3"]],
        AfterBatches::Fail,
    ));
    let search = Arc::new(TableSearch::new().with(
        "Acme q3",
        vec![hit("https://acme.io/q3", "Acme Q3 results", "Revenue up")],
    ));
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("planner failure is not fatal");

    assert_eq!(outcome.stop_reason, StopReason::PlannerUnavailable);
    assert_eq!(outcome.state.iteration(), 1);
    assert_eq!(model.planner_calls(), 2);
    assert_eq!(outcome.state.curated.len(), 1);
}

#[tokio::test]
async fn malformed_tool_call_curates_what_was_collected() {
    let config = test_config(5);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3"]],
        AfterBatches::Malformed,
    ));
    let search = Arc::new(TableSearch::new().with(
        "Acme q3",
        vec![hit("https://acme.io/q3", "Acme Q3 results", "Revenue up")],
    ));
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("malformed planner output is not fatal");

    assert_eq!(outcome.stop_reason, StopReason::MalformedPlannerOutput);
    assert_eq!(outcome.state.iteration(), 1);
    assert_eq!(model.planner_calls(), 2);
    assert_eq!(search.requests().len(), 1);
    assert_eq!(outcome.state.curated.len(), 1);
    assert!(outcome.state.curated.contains("https://acme.io/q3"));
}

#[tokio::test]
async fn exhausted_rate_limit_curates_early() {
    // The first planner call drains the bucket; the next one cannot be
    // covered within the acquire timeout.
    let config = ConfigLoader::parse(
        r#"
        [research]
        max_iterations = 5

        [rate_limit]
        capacity = 10
        refill_per_second = 1.0
        acquire_timeout_ms = 50
        "#,
    )
    .expect("config parses");
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3"]],
        AfterBatches::RepeatLast,
    ));
    let search = Arc::new(TableSearch::new().with(
        "Acme q3",
        vec![hit("https://acme.io/q3", "Acme Q3 results", "Revenue up")],
    ));
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("rate limiting is not fatal");

    assert_eq!(outcome.stop_reason, StopReason::RateLimited);
    assert_eq!(outcome.state.iteration(), 1);
    assert_eq!(model.planner_calls(), 1);
    assert_eq!(model.other_calls(), 0);
    assert!(outcome.curation.ranking_fallback);
    assert_eq!(outcome.state.curated.len(), 1);
}

#[tokio::test]
async fn extraction_failure_keeps_snippet_documents() {
    let config = test_config(5);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3"]],
        AfterBatches::Complete,
    ));
    let search = Arc::new(
        TableSearch::new()
            .with(
                "Acme q3",
                vec![hit("https://acme.io/q3", "Acme Q3 results", "Revenue up")],
            )
            .failing_extract(),
    );
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &CancellationToken::new())
        .await
        .expect("extraction failure is not fatal");

    assert!(outcome.curation.extraction_failed);
    let record = outcome
        .state
        .curated
        .get("https://acme.io/q3")
        .expect("document still curated");
    assert_eq!(record.raw_content, None);
    assert_eq!(record.snippet, "Revenue up");
}

#[tokio::test]
async fn cancelled_before_start_makes_no_calls() {
    let config = test_config(5);
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3"]],
        AfterBatches::RepeatLast,
    ));
    let search = Arc::new(TableSearch::new());
    let (controller, _) = build_controller(&config, model.clone(), search.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &cancel)
        .await
        .expect("cancellation is not an error");

    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert_eq!(model.planner_calls(), 0);
    assert_eq!(model.other_calls(), 0);
    assert!(search.requests().is_empty());
}

#[tokio::test]
async fn cancellation_during_a_batch_stops_without_counting_it() {
    let config = test_config(5);
    let cancel = CancellationToken::new();
    let model = Arc::new(ScriptedModel::new(
        vec![vec!["Acme q3", "hang forever"]],
        AfterBatches::RepeatLast,
    ));
    let search = Arc::new(
        TableSearch::new()
            .with(
                "Acme q3",
                vec![hit("https://acme.io/q3", "Acme Q3 results", "Revenue up")],
            )
            .cancelling(cancel.clone()),
    );
    let (controller, _) = build_controller(&config, model.clone(), search.clone());

    let outcome = controller
        .run(ResearchTarget::new("Acme"), &cancel)
        .await
        .expect("cancellation is not an error");

    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert_eq!(outcome.state.iteration(), 0);
    assert_eq!(model.planner_calls(), 1);
    assert_eq!(model.other_calls(), 0);
    assert_eq!(search.extract_calls(), 0);

    // The query that finished before the cancel is still collected and curated.
    assert_eq!(outcome.state.collected.len(), 1);
    assert!(outcome.state.collected.contains("https://acme.io/q3"));
    assert_eq!(outcome.state.curated.len(), 1);
}
