use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::backlog::CuriosityStore;
use crate::error::Result;
use crate::mission::MissionRunner;
use crate::types::{ExplorationOutcome, ExplorationResult, ProjectTask};

const MAX_FOLLOW_UPS: usize = 5;
const PROMOTION_CONFIDENCE: f64 = 0.7;

/// Knowledge-graph collaborator. High-confidence findings get promoted to
/// durable facts; the returned id is recorded on the task.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn add_fact(
        &self,
        fact: &str,
        group_id: &str,
        source: &str,
        confidence: f64,
    ) -> std::result::Result<String, String>;
}

/// Runs curiosity exploration missions and stores what they learn.
pub struct Explorer {
    store: Arc<CuriosityStore>,
    runner: Arc<dyn MissionRunner>,
    graph: Option<Arc<dyn KnowledgeGraph>>,
    user_id: String,
}

impl Explorer {
    pub fn new(
        store: Arc<CuriosityStore>,
        runner: Arc<dyn MissionRunner>,
        graph: Option<Arc<dyn KnowledgeGraph>>,
        user_id: String,
    ) -> Self {
        Self {
            store,
            runner,
            graph,
            user_id,
        }
    }

    pub fn has_pending_curiosities(&self) -> Result<bool> {
        self.store.has_pending()
    }

    /// Claim and execute the best ready curiosity task.
    ///
    /// Returns `None` when nothing was claimable. Failures re-queue the
    /// task with its error recorded.
    pub async fn explore_next(&self) -> Result<Option<ExplorationOutcome>> {
        let Some(task) = self.store.claim_next()? else {
            return Ok(None);
        };
        info!(task_id = task.id, title = %task.title, "exploring curiosity task");

        let (result, error_message) = self.run_exploration(&task).await;
        self.store
            .persist_result(task.id, result.as_ref(), error_message.as_deref())?;

        if let Some(result) = &result {
            if !result.findings.is_empty() {
                self.store.store_findings(&task, &self.user_id, result)?;
                self.promote_findings(&task, result).await;
            }
            self.spawn_follow_ups(&task, &result.follow_up_questions)?;
        }

        Ok(Some(ExplorationOutcome {
            task_id: task.id,
            result,
            error_message,
        }))
    }

    async fn run_exploration(
        &self,
        task: &ProjectTask,
    ) -> (Option<ExplorationResult>, Option<String>) {
        let prompt = build_prompt(task);
        let output = match self.runner.run(&task.working_dir, &prompt).await {
            Ok(output) if !output.trim().is_empty() => output,
            Ok(_) => return (None, Some("no exploration output".to_string())),
            Err(e) => return (None, Some(e)),
        };

        match parse_mission_output(&output) {
            Some(value) => (Some(build_result(&value)), None),
            None => (
                None,
                Some("failed to parse exploration output".to_string()),
            ),
        }
    }

    async fn promote_findings(&self, task: &ProjectTask, result: &ExplorationResult) {
        let Some(graph) = &self.graph else {
            return;
        };
        if result.confidence < PROMOTION_CONFIDENCE {
            return;
        }

        let mut promoted = Vec::new();
        for finding in &result.findings {
            match graph
                .add_fact(
                    finding,
                    &self.user_id,
                    &format!("curiosity:{}", task.id),
                    result.confidence,
                )
                .await
            {
                Ok(fact_id) => promoted.push(fact_id),
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "finding promotion failed");
                    return;
                }
            }
        }
        if !promoted.is_empty() {
            if let Err(e) = self.store.record_promotions(task.id, &promoted) {
                warn!(task_id = task.id, error = %e, "failed to record promoted facts");
            }
        }
    }

    fn spawn_follow_ups(&self, task: &ProjectTask, questions: &[String]) -> Result<()> {
        let mut spawned = 0;
        for question in questions
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .take(MAX_FOLLOW_UPS)
        {
            if self.store.spawn_follow_up(task, question)?.is_some() {
                spawned += 1;
            }
        }
        if spawned > 0 {
            info!(
                count = spawned,
                task_id = task.id,
                "spawned follow-up curiosity tasks"
            );
        }
        Ok(())
    }
}

fn build_prompt(task: &ProjectTask) -> String {
    let source_context = task
        .extra
        .source_context
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&task.description);
    format!(
        "You are exploring a topic the user mentioned: {topic}\n\n\
         Context from conversation:\n{source_context}\n\n\
         Your task:\n\
         1. Research this topic using available tools (web search, knowledge lookup)\n\
         2. Gather key facts that would be useful for future conversations\n\
         3. Note any follow-up questions worth exploring\n\n\
         Output JSON:\n\
         {{\n\
             \"findings\": [\"fact 1\", \"fact 2\", ...],\n\
             \"confidence\": 0.0-1.0,\n\
             \"follow_up_questions\": [\"question 1\", ...],\n\
             \"worth_sharing\": true/false,\n\
             \"share_message\": \"optional message if worth sharing\"\n\
         }}\n",
        topic = task.title,
    )
}

/// Pull the decision object out of mission output: a fenced ```json block
/// first, otherwise the first parseable JSON object anywhere in the text.
/// Shared with the ambient monitor, whose missions answer in the same shape.
pub fn parse_mission_output(text: &str) -> Option<serde_json::Value> {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap());

    if let Some(caps) = fenced.captures(text) {
        return serde_json::from_str(caps.get(1)?.as_str()).ok();
    }

    for (idx, _) in text.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&text[idx..]).into_iter::<serde_json::Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

fn build_result(value: &serde_json::Value) -> ExplorationResult {
    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        serde_json::Value::String(s) => Some(s.trim().to_string()),
                        other => Some(other.to_string()),
                    })
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };

    ExplorationResult {
        findings: string_list("findings"),
        confidence: value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        follow_up_questions: string_list("follow_up_questions"),
        worth_sharing: value
            .get("worth_sharing")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        share_message: value
            .get("share_message")
            .and_then(|v| v.as_str())
            .map(String::from)
            .filter(|s| !s.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskExtra, TaskStatus};
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct ScriptedRunner {
        outputs: Mutex<Vec<std::result::Result<String, String>>>,
    }

    #[async_trait]
    impl MissionRunner for ScriptedRunner {
        async fn run(&self, _working_dir: &str, _prompt: &str) -> std::result::Result<String, String> {
            self.outputs.lock().unwrap().remove(0)
        }
    }

    struct RecordingGraph {
        facts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KnowledgeGraph for RecordingGraph {
        async fn add_fact(
            &self,
            fact: &str,
            _group_id: &str,
            _source: &str,
            _confidence: f64,
        ) -> std::result::Result<String, String> {
            let mut facts = self.facts.lock().unwrap();
            facts.push(fact.to_string());
            Ok(format!("fact-{}", facts.len()))
        }
    }

    fn store() -> Arc<CuriosityStore> {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Arc::new(CuriosityStore::new(conn))
    }

    fn explorer_with(
        store: Arc<CuriosityStore>,
        outputs: Vec<std::result::Result<String, String>>,
        graph: Option<Arc<dyn KnowledgeGraph>>,
    ) -> Explorer {
        Explorer::new(
            store,
            Arc::new(ScriptedRunner {
                outputs: Mutex::new(outputs),
            }),
            graph,
            "alice".to_string(),
        )
    }

    #[test]
    fn parses_fenced_json_block() {
        let text = "Here is what I found.\n```json\n{\"findings\": [\"x\"], \"confidence\": 0.9}\n```\nDone.";
        let value = parse_mission_output(text).unwrap();
        assert_eq!(value["confidence"], serde_json::json!(0.9));
    }

    #[test]
    fn parses_bare_object_in_prose() {
        let text = "Summary: {\"findings\": [], \"confidence\": 0.4} trailing words";
        let value = parse_mission_output(text).unwrap();
        assert_eq!(value["confidence"], serde_json::json!(0.4));
    }

    #[test]
    fn garbage_output_parses_to_none() {
        assert!(parse_mission_output("nothing json-like here { broken").is_none());
    }

    #[tokio::test]
    async fn successful_exploration_completes_task_and_spawns_follow_ups() {
        let store = store();
        let task_id = store
            .insert_task(
                "/tmp",
                "I love purple!",
                "Curiosity trigger: high emotional intensity",
                63,
                TaskStatus::Ready,
                None,
                None,
                &TaskExtra {
                    source_context: Some("I love purple!".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let graph = Arc::new(RecordingGraph {
            facts: Mutex::new(Vec::new()),
        });
        let output = serde_json::json!({
            "findings": ["Purple is a secondary color."],
            "confidence": 0.85,
            "follow_up_questions": ["Why do users bond to colors?"],
            "worth_sharing": true,
        })
        .to_string();
        let explorer = explorer_with(store.clone(), vec![Ok(output)], Some(graph.clone()));

        let outcome = explorer.explore_next().await.unwrap().unwrap();
        assert_eq!(outcome.task_id, task_id);
        let result = outcome.result.unwrap();
        assert!((result.confidence - 0.85).abs() < 1e-9);

        let task = store.get(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.extra.findings, vec!["Purple is a secondary color."]);
        assert_eq!(task.extra.promoted_fact_ids, vec!["fact-1"]);

        let findings = store.findings_for_task(task_id).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].worth_sharing);

        let follow_up = store
            .find_active_by_title("Why do users bond to colors?")
            .unwrap()
            .expect("follow-up spawned");
        assert_eq!(follow_up.discovered_from_task_id, Some(task_id));
    }

    #[tokio::test]
    async fn unparseable_output_requeues_the_task() {
        let store = store();
        let task_id = store
            .insert_task(
                "/tmp",
                "topic",
                "d",
                40,
                TaskStatus::Ready,
                None,
                None,
                &TaskExtra::default(),
            )
            .unwrap();

        let explorer = explorer_with(
            store.clone(),
            vec![Ok("I could not find anything useful.".to_string())],
            None,
        );
        let outcome = explorer.explore_next().await.unwrap().unwrap();
        assert!(outcome.result.is_none());

        let task = store.get(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, 1);
        assert!(task.last_error.is_some());
    }

    #[tokio::test]
    async fn low_confidence_findings_are_not_promoted() {
        let store = store();
        store
            .insert_task(
                "/tmp",
                "topic",
                "d",
                40,
                TaskStatus::Ready,
                None,
                None,
                &TaskExtra::default(),
            )
            .unwrap();

        let graph = Arc::new(RecordingGraph {
            facts: Mutex::new(Vec::new()),
        });
        let output = serde_json::json!({
            "findings": ["weak fact"],
            "confidence": 0.5,
        })
        .to_string();
        let explorer = explorer_with(store.clone(), vec![Ok(output)], Some(graph.clone()));
        explorer.explore_next().await.unwrap();

        assert!(graph.facts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn follow_ups_cap_at_five() {
        let store = store();
        let task_id = store
            .insert_task(
                "/tmp",
                "topic",
                "d",
                40,
                TaskStatus::Ready,
                None,
                None,
                &TaskExtra::default(),
            )
            .unwrap();

        let questions: Vec<String> = (0..8).map(|i| format!("question {i}")).collect();
        let output = serde_json::json!({
            "findings": [],
            "confidence": 0.6,
            "follow_up_questions": questions,
        })
        .to_string();
        let explorer = explorer_with(store.clone(), vec![Ok(output)], None);
        explorer.explore_next().await.unwrap();

        let pending = store.pending_tasks(None).unwrap();
        let chains = pending
            .iter()
            .filter(|t| t.discovered_from_task_id == Some(task_id))
            .count();
        assert_eq!(chains, 5);
    }

    #[tokio::test]
    async fn nothing_ready_returns_none() {
        let explorer = explorer_with(store(), vec![], None);
        assert!(explorer.explore_next().await.unwrap().is_none());
    }
}
