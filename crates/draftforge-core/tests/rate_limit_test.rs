// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rate limiter integration tests: the process-wide call and token budgets
//! gate provider calls across chunks and sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use draftforge_core::session::SessionStatus;

use common::{
    Behavior, MockProvider, init_tracing, orchestrator_with, request, test_config,
    wait_for_terminal,
};

#[tokio::test(start_paused = true)]
async fn test_second_call_waits_for_the_window() {
    init_tracing();
    let mut config = test_config();
    config.calls_per_minute = 1;
    config.permit_acquire_timeout = Duration::from_secs(120);
    let provider = Arc::new(MockProvider::new(Behavior::Succeed));
    let (orchestrator, _store) = orchestrator_with(config, provider.clone());

    // Two chunks requested concurrently (cap is 4)
    let session_id = orchestrator.submit(request(2)).await.unwrap();
    let snapshot = wait_for_terminal(&orchestrator, &session_id).await;
    assert_eq!(snapshot.status, SessionStatus::Completed);

    let mut calls = provider.calls();
    calls.sort_by_key(|c| c.at);
    assert_eq!(calls.len(), 2);

    // The second provider call started only after the limiter window
    // permitted it, never before
    let gap = calls[1].at.duration_since(calls[0].at);
    assert!(gap >= Duration::from_secs(59), "gap was {:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn test_limiter_is_shared_across_sessions() {
    init_tracing();
    let mut config = test_config();
    config.calls_per_minute = 1;
    config.permit_acquire_timeout = Duration::from_secs(120);
    let provider = Arc::new(MockProvider::new(Behavior::Succeed));
    let (orchestrator, _store) = orchestrator_with(config, provider.clone());

    let a = orchestrator.submit(request(1)).await.unwrap();
    let b = orchestrator.submit(request(1)).await.unwrap();
    wait_for_terminal(&orchestrator, &a).await;
    wait_for_terminal(&orchestrator, &b).await;

    let mut calls = provider.calls();
    calls.sort_by_key(|c| c.at);
    assert_eq!(calls.len(), 2);
    // Different sessions, one shared budget
    assert_ne!(calls[0].session_id, calls[1].session_id);
    assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_secs(59));
}

#[tokio::test(start_paused = true)]
async fn test_token_budget_throttles_independently_of_calls() {
    init_tracing();
    let mut config = test_config();
    // Calls are plentiful; the token budget is the constraint. Each chunk
    // costs 100 tokens against a 150/minute budget.
    config.calls_per_minute = 1000;
    config.tokens_per_minute = 150;
    config.permit_acquire_timeout = Duration::from_secs(120);
    let provider = Arc::new(MockProvider::new(Behavior::Succeed));
    let (orchestrator, _store) = orchestrator_with(config, provider.clone());

    let session_id = orchestrator.submit(request(2)).await.unwrap();
    let snapshot = wait_for_terminal(&orchestrator, &session_id).await;
    assert_eq!(snapshot.status, SessionStatus::Completed);

    let mut calls = provider.calls();
    calls.sort_by_key(|c| c.at);
    // 50 tokens remain after the first call; the missing 50 refill in 20s
    let gap = calls[1].at.duration_since(calls[0].at);
    assert!(gap >= Duration::from_secs(19), "gap was {:?}", gap);
    assert!(gap <= Duration::from_secs(25), "gap was {:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn test_permit_timeout_is_a_transient_failure() {
    init_tracing();
    let mut config = test_config();
    config.calls_per_minute = 1;
    // Not enough patience to ride out the 60s refill
    config.permit_acquire_timeout = Duration::from_secs(5);
    let provider = Arc::new(MockProvider::new(Behavior::Succeed));
    let (orchestrator, _store) = orchestrator_with(config, provider.clone());

    let session_id = orchestrator.submit(request(2)).await.unwrap();
    let snapshot = wait_for_terminal(&orchestrator, &session_id).await;

    // The first chunk took the only permit; the second exhausted its
    // retries waiting and failed the session
    assert_eq!(snapshot.status, SessionStatus::Failed);
    let starved = snapshot
        .chunks
        .iter()
        .find(|c| c.error.as_deref().is_some_and(|e| e.contains("permit")))
        .expect("one chunk should have starved on the limiter");
    assert_eq!(starved.attempt, 3);
    // The starved chunk never reached the provider
    assert_eq!(provider.call_count(), 1);
}
