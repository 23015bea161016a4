// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Panic-guarded task spawning.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn `future`, logging a panic instead of letting it reach the join
/// handle. The handle resolves to `false` if the future panicked.
pub(crate) fn spawn_guarded<F>(task: String, future: F) -> JoinHandle<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(()) => true,
            Err(panic) => {
                error!(task = %task, panic = %panic_message(&*panic), "Task panicked");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*panic), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*panic), "bang");
        let panic: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*panic), "unknown panic");
    }

    #[tokio::test]
    async fn test_spawn_guarded_reports_panic() {
        assert!(spawn_guarded("ok".to_string(), async {}).await.unwrap());
        let panicked = spawn_guarded("boom".to_string(), async { panic!("boom") });
        assert!(!panicked.await.unwrap());
    }
}
