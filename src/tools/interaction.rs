//! 与用户交互的工具：提问、提交评审、宣告完成
//!
//! 这些工具没有副作用，只通过 ToolEffect 告诉任务循环接下来进入 WaitingForUser 或 Completed。

use async_trait::async_trait;

use crate::core::{CancellationSignal, TaskError};
use crate::parser::ToolInput;
use crate::tools::definitions::{ASK_FOLLOWUP_QUESTION, ATTEMPT_COMPLETION, SUBMIT_REVIEW};
use crate::tools::{Tool, ToolOutput};

/// ask_followup_question
#[derive(Debug, Default, Clone, Copy)]
pub struct AskFollowupQuestionTool;

#[async_trait]
impl Tool for AskFollowupQuestionTool {
    fn name(&self) -> &str {
        ASK_FOLLOWUP_QUESTION
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let question = input.require_text("question")?.trim();
        Ok(ToolOutput::await_user(question))
    }
}

/// attempt_completion
#[derive(Debug, Default, Clone, Copy)]
pub struct AttemptCompletionTool;

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        ATTEMPT_COMPLETION
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let result = input.require_text("result")?.trim();
        Ok(ToolOutput::complete(result))
    }
}

/// submit_review：评审内容（progress_summary / questions / next_steps）整体作为不透明文本交给用户
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitReviewTool;

#[async_trait]
impl Tool for SubmitReviewTool {
    fn name(&self) -> &str {
        SUBMIT_REVIEW
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let review = input.require_text("review")?;
        Ok(ToolOutput::await_user(review))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FieldValue;
    use crate::tools::ToolEffect;

    fn input(name: &str, value: &str) -> ToolInput {
        [(name, FieldValue::Text(value.into()))].into_iter().collect()
    }

    #[tokio::test]
    async fn test_effects() {
        let never = CancellationSignal::never();
        let out = AskFollowupQuestionTool
            .execute(&input("question", " Which file? "), &never)
            .await
            .unwrap();
        assert_eq!(out.effect, ToolEffect::AwaitUser);
        assert_eq!(out.text, "Which file?");

        let out = AttemptCompletionTool
            .execute(&input("result", "done"), &never)
            .await
            .unwrap();
        assert_eq!(out.effect, ToolEffect::Complete);

        let review = "<progress_summary>a</progress_summary><questions>b</questions>";
        let out = SubmitReviewTool
            .execute(&input("review", review), &never)
            .await
            .unwrap();
        assert_eq!(out.effect, ToolEffect::AwaitUser);
        assert_eq!(out.text, review);
    }
}
