use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ExecutorConfig;
use crate::dom::ElementSource;
use crate::error::{BrowserError, ExecutionError};
use crate::types::{ActionKind, ActionProposal, DecisionBundle, ElementDescriptor, TurnOutcome};

/// Commands the executor needs from one browsing context.
#[async_trait]
pub trait BrowserPage: ElementSource + Send + Sync + Sized {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Wait until `selector` resolves to a rendered element.
    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Click `selector` and return the browsing context the click opened.
    async fn click_into_new_page(&self, selector: &str, timeout: Duration) -> Result<Self, BrowserError>;

    /// Set the value of a native text control directly.
    async fn fill(&self, selector: &str, value: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Type into whatever currently has focus.
    async fn type_text(&self, text: &str) -> Result<(), BrowserError>;

    async fn wait_for_content_loaded(&self, timeout: Duration) -> Result<(), BrowserError>;

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError>;
}

/// The browser-level part of an executable action.
enum Command<'a> {
    Click,
    Type(&'a str),
}

/// Tags whose value can be set directly instead of simulated keystrokes.
fn is_text_control(tag: &str) -> bool {
    matches!(tag, "input" | "textarea")
}

/// Executes validated bundles and owns the active page. A click that opens
/// a new tab replaces the page; nothing else keeps the old one.
pub struct ActionExecutor<P> {
    page: P,
    timeouts: ExecutorConfig,
}

impl<P: BrowserPage> ActionExecutor<P> {
    pub fn new(page: P, timeouts: ExecutorConfig) -> Self {
        Self { page, timeouts }
    }

    /// The page every other component must use this turn.
    pub fn page(&self) -> &P {
        &self.page
    }

    /// Run the bundle in order, stopping after the first failure. Returns one
    /// outcome per attempted action, the failing one included.
    pub async fn execute(&mut self, bundle: &DecisionBundle, elements: &[ElementDescriptor]) -> Vec<TurnOutcome> {
        let mut outcomes = Vec::with_capacity(bundle.actions.len());
        for (i, action) in bundle.actions.iter().enumerate() {
            let command = match action.kind {
                ActionKind::Click => Command::Click,
                ActionKind::Type => Command::Type(action.type_value.as_deref().unwrap_or_default()),
                ActionKind::AskUser | ActionKind::Finish | ActionKind::Fail => {
                    warn!(position = i + 1, kind = %action.kind, "control action inside a bundle, stopping execution");
                    break;
                }
            };
            match self.perform(action, command, elements).await {
                Ok(()) => {
                    info!(position = i + 1, kind = %action.kind, "action succeeded");
                    outcomes.push(TurnOutcome::succeeded(action));
                }
                Err(e) => {
                    warn!(position = i + 1, kind = %action.kind, error = %e, "action failed");
                    outcomes.push(TurnOutcome::failed(action, &e));
                    break;
                }
            }
        }
        outcomes
    }

    async fn perform(
        &mut self,
        action: &ActionProposal,
        command: Command<'_>,
        elements: &[ElementDescriptor],
    ) -> Result<(), ExecutionError> {
        let target = resolve(action, elements)?;
        info!(
            kind = %action.kind,
            index = target.index,
            selector = %target.selector,
            "executing action"
        );
        match command {
            Command::Click => self.click(&target.selector).await?,
            Command::Type(value) => self.type_into(target, value).await?,
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.page.wait_visible(selector, self.timeouts.visible_timeout()).await?;

        let opens_new_page = self.page.attribute(selector, "target").await?.as_deref() == Some("_blank");
        if opens_new_page {
            info!(selector, "element opens a new page, waiting for it");
            let new_page = self
                .page
                .click_into_new_page(selector, self.timeouts.new_page_timeout())
                .await?;
            self.page = new_page;
            info!("switched to the new page");
        } else {
            self.page.click(selector).await?;
        }

        self.page.wait_for_content_loaded(self.timeouts.load_timeout()).await
    }

    async fn type_into(&mut self, target: &ElementDescriptor, value: &str) -> Result<(), BrowserError> {
        if is_text_control(&target.tag) {
            return self
                .page
                .fill(&target.selector, value, self.timeouts.type_timeout())
                .await;
        }
        self.page.wait_visible(&target.selector, self.timeouts.type_timeout()).await?;
        self.page.click(&target.selector).await?;
        self.page.type_text(value).await
    }
}

fn resolve<'a>(action: &ActionProposal, elements: &'a [ElementDescriptor]) -> Result<&'a ElementDescriptor, ExecutionError> {
    let index = action
        .target_element_index
        .ok_or_else(|| ExecutionError::InvalidIndex("none".into()))?;
    usize::try_from(index)
        .ok()
        .and_then(|i| elements.get(i))
        .ok_or_else(|| ExecutionError::InvalidIndex(index.to_string()))
}
