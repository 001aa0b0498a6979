//! Browser control on top of a pluggable automation driver
//!
//! [`BrowserDriver`] is the raw capability set (navigate, find, click, keys,
//! scripts, frame/window switching). [`BrowserSession`] layers the pipeline's
//! operations on it: retried navigation, poll-based waits, and frame-context
//! tracking so a top-level selector is never issued inside an iframe.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{E2eError, E2eResult};
use crate::retry::{Attempts, Poller};

/// WebDriver key codes used by the pipeline.
pub mod keys {
    pub const RETURN: &str = "\u{E006}";
    pub const CONTROL: &str = "\u{E009}";
}

/// Opaque reference to an element in the current browsing context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// One step of a synthesized keyboard sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Down(String),
    Up(String),
}

impl KeyAction {
    /// Press and release every character of `text` in order.
    pub fn typing(text: &str) -> Vec<KeyAction> {
        text.chars()
            .flat_map(|c| [KeyAction::Down(c.to_string()), KeyAction::Up(c.to_string())])
            .collect()
    }

    /// Hold `modifier` while pressing `key`.
    pub fn chord(modifier: &str, key: &str) -> Vec<KeyAction> {
        vec![
            KeyAction::Down(modifier.to_string()),
            KeyAction::Down(key.to_string()),
            KeyAction::Up(key.to_string()),
            KeyAction::Up(modifier.to_string()),
        ]
    }
}

/// Browser automation capabilities, independent of the wire protocol.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> E2eResult<()>;
    async fn find_element(&self, selector: &str) -> E2eResult<ElementRef>;
    async fn element_text(&self, element: &ElementRef) -> E2eResult<String>;
    async fn click(&self, element: &ElementRef) -> E2eResult<()>;
    async fn send_keys(&self, element: &ElementRef, text: &str) -> E2eResult<()>;
    async fn perform_keys(&self, actions: &[KeyAction]) -> E2eResult<()>;
    async fn execute_script(&self, script: &str) -> E2eResult<Value>;
    async fn switch_to_frame(&self, element: &ElementRef) -> E2eResult<()>;
    async fn switch_to_window(&self, handle: &str) -> E2eResult<()>;
    async fn window_handles(&self) -> E2eResult<Vec<String>>;
    async fn quit(&self) -> E2eResult<()>;
}

/// Produces a fresh driver connected to a running browser.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    type Driver: BrowserDriver + 'static;

    async fn launch(&self) -> E2eResult<Self::Driver>;
}

/// Which document selectors currently resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameContext {
    TopLevel,
    Frame(String),
}

/// A browser session driven by the pipeline.
pub struct BrowserSession<D> {
    driver: D,
    main_window: Option<String>,
    frame: FrameContext,
    poller: Poller,
    navigation: Attempts,
}

/// Frame-scoped view of a session, only available inside
/// [`BrowserSession::with_frame`].
pub struct FrameScope<'s, D> {
    session: &'s BrowserSession<D>,
}

/// Firefox reports a refused or reset page load as `unknown error` with an
/// `about:neterror` message. Session-level failures are final.
fn navigation_retryable(e: &E2eError) -> bool {
    match e {
        E2eError::WebDriver { code, .. } => code == "unknown error",
        other => other.is_transient(),
    }
}

impl<D: BrowserDriver> BrowserSession<D> {
    pub fn new(driver: D, poller: Poller, navigation: Attempts) -> Self {
        Self {
            driver,
            main_window: None,
            frame: FrameContext::TopLevel,
            poller,
            navigation,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn frame_context(&self) -> &FrameContext {
        &self.frame
    }

    fn ensure_top_level(&self, selector: &str) -> E2eResult<()> {
        match &self.frame {
            FrameContext::TopLevel => Ok(()),
            FrameContext::Frame(frame) => Err(E2eError::FrameContext {
                selector: selector.to_string(),
                frame: frame.clone(),
            }),
        }
    }

    /// Load `url`, retrying while the server is not yet accepting
    /// connections.
    pub async fn navigate(&mut self, url: &str) -> E2eResult<()> {
        let driver = &self.driver;
        let what = format!("loading {}", url);
        self.navigation
            .retry(&what, navigation_retryable, || driver.navigate(url))
            .await
            .map_err(|e| {
                if let E2eError::TooManyRetries { .. } = e {
                    error!("Too many retries loading {}, bailing out", url);
                }
                e
            })?;
        // Navigation always lands in the top-level document.
        self.frame = FrameContext::TopLevel;
        Ok(())
    }

    /// Top-level element lookup.
    pub async fn find(&self, selector: &str) -> E2eResult<ElementRef> {
        self.ensure_top_level(selector)?;
        self.driver.find_element(selector).await
    }

    /// Poll until a top-level element matches `selector`.
    pub async fn wait_for_element(&self, selector: &str) -> E2eResult<ElementRef> {
        self.ensure_top_level(selector)?;
        let driver = &self.driver;
        self.poller
            .until_some(selector, || async move {
                Ok::<_, E2eError>(Some(driver.find_element(selector).await?))
            })
            .await
    }

    pub async fn click(&self, selector: &str) -> E2eResult<()> {
        let element = self.find(selector).await?;
        self.driver.click(&element).await
    }

    pub async fn click_element(&self, element: &ElementRef) -> E2eResult<()> {
        self.driver.click(element).await
    }

    pub async fn send_keys(&self, selector: &str, text: &str) -> E2eResult<()> {
        let element = self.find(selector).await?;
        self.driver.send_keys(&element, text).await
    }

    /// Focus the quick-search input with the Ctrl+S chord.
    pub async fn focus_search(&self) -> E2eResult<()> {
        self.ensure_top_level("<quick search>")?;
        self.driver.perform_keys(&KeyAction::chord(keys::CONTROL, "S")).await
    }

    /// Type `text` into whatever element has focus.
    pub async fn type_text(&self, text: &str) -> E2eResult<()> {
        self.driver.perform_keys(&KeyAction::typing(text)).await
    }

    pub async fn wait_for_text(&self, selector: &str, expected: &str) -> E2eResult<()> {
        self.ensure_top_level(selector)?;
        self.poll_text(selector, expected).await
    }

    /// Wait until `script` evaluates to `expected` in the current document.
    /// Script errors count as "not yet", since the target may not exist.
    pub async fn wait_for_script_value(&self, script: &str, expected: impl Into<Value>) -> E2eResult<()> {
        self.ensure_top_level(script)?;
        let expected = expected.into();
        let driver = &self.driver;
        let what = format!("`{}` == {}", script, expected);
        let expected = &expected;
        self.poller
            .until(&what, || async move {
                Ok::<bool, E2eError>(driver.execute_script(script).await? == *expected)
            })
            .await
    }

    async fn poll_text(&self, selector: &str, expected: &str) -> E2eResult<()> {
        let driver = &self.driver;
        let what = format!("{:?} in {}", expected, selector);
        self.poller
            .until(&what, || async move {
                let element = driver.find_element(selector).await?;
                let text = driver.element_text(&element).await?;
                Ok::<bool, E2eError>(text.contains(expected))
            })
            .await
    }

    /// Switch into the iframe matched by `selector`.
    ///
    /// Prefer [`with_frame`](Self::with_frame); a session left inside a frame
    /// rejects every top-level lookup until [`leave_frame`](Self::leave_frame).
    pub async fn enter_frame(&mut self, selector: &str) -> E2eResult<()> {
        let element = self.find(selector).await?;
        if self.main_window.is_none() {
            let handles = self.driver.window_handles().await?;
            let main = handles
                .into_iter()
                .next()
                .ok_or_else(|| E2eError::WebDriver {
                    code: "no such window".to_string(),
                    message: "browser reported no window handles".to_string(),
                })?;
            self.main_window = Some(main);
        }
        self.driver.switch_to_frame(&element).await?;
        debug!("Entered frame {}", selector);
        self.frame = FrameContext::Frame(selector.to_string());
        Ok(())
    }

    /// Return to the top-level window.
    pub async fn leave_frame(&mut self) -> E2eResult<()> {
        if let Some(main) = &self.main_window {
            self.driver.switch_to_window(main).await?;
        }
        self.frame = FrameContext::TopLevel;
        Ok(())
    }

    /// Run `body` inside the iframe matched by `selector`, returning to the
    /// top-level window afterwards whether or not `body` succeeded.
    pub async fn with_frame<T, F>(&mut self, selector: &str, body: F) -> E2eResult<T>
    where
        D: 'static,
        F: for<'s> FnOnce(FrameScope<'s, D>) -> BoxFuture<'s, E2eResult<T>>,
    {
        self.enter_frame(selector).await?;
        let result = body(FrameScope { session: &*self }).await;
        let restored = self.leave_frame().await;
        let value = result?;
        restored?;
        Ok(value)
    }

    pub async fn close(self) -> E2eResult<()> {
        self.driver.quit().await
    }
}

impl<'s, D: BrowserDriver> FrameScope<'s, D> {
    pub async fn wait_for_text(&self, selector: &str, expected: &str) -> E2eResult<()> {
        self.session.poll_text(selector, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_chord_wraps_key_in_modifier() {
        let actions = KeyAction::chord(keys::CONTROL, "S");
        assert_eq!(actions.first(), Some(&KeyAction::Down(keys::CONTROL.to_string())));
        assert_eq!(actions.last(), Some(&KeyAction::Up(keys::CONTROL.to_string())));
        assert_eq!(actions.len(), 4);
    }

    #[test]
    fn test_typing_presses_each_char() {
        let actions = KeyAction::typing("Hi");
        assert_eq!(
            actions,
            vec![
                KeyAction::Down("H".into()),
                KeyAction::Up("H".into()),
                KeyAction::Down("i".into()),
                KeyAction::Up("i".into()),
            ]
        );
    }

    #[test_case("unknown error", true ; "page load failure")]
    #[test_case("invalid session id", false ; "dead session")]
    #[test_case("session not created", false ; "no session")]
    #[test_case("no such window", false ; "closed window")]
    fn test_navigation_retry_by_code(code: &str, retried: bool) {
        let err = E2eError::WebDriver {
            code: code.into(),
            message: "Reached error page: about:neterror?e=connectionFailure".into(),
        };
        assert_eq!(navigation_retryable(&err), retried);
    }

    #[test]
    fn test_navigation_does_not_retry_config_errors() {
        assert!(!navigation_retryable(&E2eError::Config("bad".into())));
    }
}
