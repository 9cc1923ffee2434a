#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use webpilot::config::TurnConfig;
use webpilot::dom::ElementSource;
use webpilot::error::{BrowserError, ModelError};
use webpilot::llm::{ModelRequest, ReasoningModel};
use webpilot::{BrowserPage, ElementDescriptor, Operator};

/// Replays canned answers in order; the last one repeats forever.
pub struct ScriptedModel {
    answers: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(answers: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn prompt(&self, call: usize) -> String {
        self.requests.lock().unwrap()[call].user_prompt.clone()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    async fn propose(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut answers = self.answers.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };
        answer.ok_or(ModelError::EmptyResponse)
    }
}

/// A well-formed tagged answer.
pub fn answer(actions: Value, rationale: &str) -> String {
    format!(
        "<thinking>Looking at the page.</thinking>\n<json_response>{}</json_response>",
        json!({ "actions": actions, "overall_explanation_of_bundle": rationale })
    )
}

pub fn click(index: i64, explanation: &str) -> Value {
    json!({ "type": "CLICK", "target_element_index": index, "explanation": explanation })
}

pub fn type_into(index: i64, value: &str, explanation: &str) -> Value {
    json!({ "type": "TYPE", "target_element_index": index, "type_value": value, "explanation": explanation })
}

pub fn finish(status: &str) -> Value {
    json!({ "type": "FINISH", "status_message": status, "explanation": "objective reached" })
}

pub fn ask_user(question: &str) -> Value {
    json!({ "type": "ASK_USER", "user_question": question, "explanation": "need input" })
}

#[derive(Default)]
struct FakeBrowser {
    fragments: HashMap<usize, Vec<String>>,
    opens_new_page: HashSet<String>,
    missing: HashSet<String>,
    log: Vec<(usize, String)>,
    next_handle: usize,
}

/// In-memory page. Clicks on `_blank` targets create a new handle; every
/// command is logged with the handle it was issued on.
#[derive(Clone)]
pub struct FakePage {
    pub handle: usize,
    browser: Arc<Mutex<FakeBrowser>>,
}

impl FakePage {
    pub fn new(fragments: Vec<String>) -> Self {
        let mut browser = FakeBrowser {
            next_handle: 1,
            ..FakeBrowser::default()
        };
        browser.fragments.insert(0, fragments);
        Self {
            handle: 0,
            browser: Arc::new(Mutex::new(browser)),
        }
    }

    pub fn with_new_page_link(self, selector: &str, fragments: Vec<String>) -> Self {
        {
            let mut browser = self.browser.lock().unwrap();
            browser.opens_new_page.insert(selector.to_string());
            let handle = browser.next_handle;
            browser.fragments.insert(handle, fragments);
        }
        self
    }

    pub fn with_missing(self, selector: &str) -> Self {
        self.browser.lock().unwrap().missing.insert(selector.to_string());
        self
    }

    pub fn log(&self) -> Vec<(usize, String)> {
        self.browser.lock().unwrap().log.clone()
    }

    fn record(&self, command: String) {
        self.browser.lock().unwrap().log.push((self.handle, command));
    }

    fn check(&self, selector: &str) -> Result<(), BrowserError> {
        if self.browser.lock().unwrap().missing.contains(selector) {
            return Err(BrowserError::NotFound(selector.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ElementSource for FakePage {
    async fn list_interactive_fragments(&self) -> Result<Vec<String>, BrowserError> {
        Ok(self
            .browser
            .lock()
            .unwrap()
            .fragments
            .get(&self.handle)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.record(format!("navigate {url}"));
        Ok(())
    }

    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.check(selector)
            .map_err(|_| BrowserError::timeout(format!("'{selector}' to become visible"), timeout))?;
        self.record(format!("wait {selector}"));
        Ok(())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError> {
        let browser = self.browser.lock().unwrap();
        Ok((name == "target" && browser.opens_new_page.contains(selector)).then(|| "_blank".to_string()))
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.check(selector)?;
        self.record(format!("click {selector}"));
        Ok(())
    }

    async fn click_into_new_page(&self, selector: &str, _timeout: Duration) -> Result<Self, BrowserError> {
        self.record(format!("click {selector}"));
        let mut browser = self.browser.lock().unwrap();
        let handle = browser.next_handle;
        browser.next_handle += 1;
        Ok(Self {
            handle,
            browser: self.browser.clone(),
        })
    }

    async fn fill(&self, selector: &str, value: &str, _timeout: Duration) -> Result<(), BrowserError> {
        self.check(selector)?;
        self.record(format!("fill {selector}={value}"));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), BrowserError> {
        self.record(format!("type {text}"));
        Ok(())
    }

    async fn wait_for_content_loaded(&self, _timeout: Duration) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

/// Answers questions from a queue and remembers what was asked.
#[derive(Default)]
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<String>>,
    interjections: Mutex<VecDeque<String>>,
    pub questions: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn answering(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            ..Self::default()
        })
    }

    pub fn interjecting(message: &str) -> Arc<Self> {
        Arc::new(Self {
            interjections: Mutex::new(VecDeque::from([message.to_string()])),
            ..Self::default()
        })
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn answer(&self, question: &str) -> anyhow::Result<String> {
        self.questions.lock().unwrap().push(question.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted answer left"))
    }

    async fn interjection(&self) -> Option<String> {
        self.interjections.lock().unwrap().pop_front()
    }
}

/// Turn timing with no waits.
pub fn instant_turns(max_turns: usize) -> TurnConfig {
    TurnConfig {
        max_turns,
        settle_delay_ms: 0,
        post_action_delay_ms: 0,
        ..TurnConfig::default()
    }
}

pub fn button(index: usize, id: &str, text: &str) -> ElementDescriptor {
    ElementDescriptor {
        index,
        selector: format!("#{id}"),
        tag: "button".into(),
        text: text.into(),
    }
}
