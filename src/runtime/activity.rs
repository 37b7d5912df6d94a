use async_trait::async_trait;

use crate::TaskId;

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Metadata handed to an activity for one execution attempt.
///
/// Activities run at least once; `attempt` lets side-effecting code detect
/// redelivery after a crashed or timed-out attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    task_id: TaskId,
    activity_name: String,
    attempt: u32,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, task_id: TaskId, activity_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id,
            activity_name: activity_name.into(),
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1 on first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "durafan::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            task_id = %self.task_id,
            attempt = %self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "durafan::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            task_id = %self.task_id,
            attempt = %self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            target: "durafan::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            task_id = %self.task_id,
            attempt = %self.attempt,
            "{}",
            message.as_ref()
        );
    }
}
