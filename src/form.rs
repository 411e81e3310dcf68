//! Form session
//!
//! Drives one query through the portal form:
//!
//! ```text
//! AwaitingReady -> Filling -> Submitting -> AwaitingOutcome -> Rows | Empty
//!        \____________\___________\_______________\______-> Failed
//! ```
//!
//! Everything runs sequentially on the caller's task. The only concurrency is
//! the completion race, where a row poll and an empty-message poll run side by
//! side until one of them sees its condition.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::controls::{compile_pattern, ControlTable};
use crate::driver::{Locator, Page};
use crate::error::{Error, Result};
use crate::extract::ResultExtractor;
use crate::model::{Field, Query, ResultSet};
use crate::resolver::ControlResolver;
use crate::wait::PollingWaiter;
use crate::LookupConfig;

/// What to do when a field with a value cannot be found on the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillPolicy {
    /// Skip it and let the portal's own validation answer
    #[default]
    Lenient,
    /// Abort the session with [`Error::FieldNotResolved`]
    Strict,
}

impl std::str::FromStr for FillPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(FillPolicy::Lenient),
            "strict" => Ok(FillPolicy::Strict),
            other => Err(Error::Config(format!("unknown fill policy '{}'", other))),
        }
    }
}

/// Where a session is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingReady,
    Filling,
    Submitting,
    AwaitingOutcome,
    Rows,
    Empty,
    Failed,
}

/// Which side of the completion race won
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// At least one result row appeared
    Rows,
    /// The portal said nothing matched
    Empty,
}

/// Fields written and fields that could not be located
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillReport {
    pub filled: Vec<Field>,
    pub unresolved: Vec<Field>,
}

/// One query against one live page
pub struct FormSession<'a> {
    page: &'a dyn Page,
    controls: &'a ControlTable,
    fill_policy: FillPolicy,
    ready_timeout: Duration,
    nav_timeout: Duration,
    outcome_timeout: Duration,
    resolver: ControlResolver,
    waiter: PollingWaiter,
    extractor: ResultExtractor,
    empty_text: Regex,
    state: SessionState,
}

impl<'a> FormSession<'a> {
    /// Bind a session to `page` using `config`
    pub fn new(page: &'a dyn Page, config: &'a LookupConfig) -> Result<Self> {
        Ok(Self {
            page,
            controls: &config.controls,
            fill_policy: config.fill_policy,
            ready_timeout: Duration::from_millis(config.selector_timeout_ms),
            nav_timeout: Duration::from_millis(config.nav_timeout_ms),
            outcome_timeout: Duration::from_millis(config.outcome_timeout_ms),
            resolver: ControlResolver::new(
                Duration::from_millis(config.field_probe_ms),
                Duration::from_millis(config.button_probe_ms),
            ),
            waiter: PollingWaiter::new(Duration::from_millis(config.poll_interval_ms)),
            extractor: ResultExtractor::new(config.row_selector.clone()),
            empty_text: compile_pattern(&config.empty_results_pattern)?,
            state: SessionState::AwaitingReady,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Form session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Navigate to the portal. Only a refused navigation is an error;
    /// whether the form rendered is decided by [`await_ready`](Self::await_ready).
    pub async fn navigate(&mut self, url: &str) -> Result<()> {
        tracing::info!("Navigating to {}", url);
        match self.page.goto(url, self.nav_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transition(SessionState::Failed);
                Err(match e {
                    Error::NavigationFailed { .. } => e,
                    other => Error::navigation(url, other.to_string()),
                })
            }
        }
    }

    /// Wait until any known field is visible in any frame
    pub async fn await_ready(&mut self) -> Result<()> {
        self.transition(SessionState::AwaitingReady);
        let page = self.page;
        let controls = self.controls;
        let resolver = &self.resolver;
        let timeout = self.ready_timeout;

        let ready = self
            .waiter
            .poll_until_or_fail(
                move || async move {
                    for field in Field::ALL {
                        let locators = controls.field(field).field_locators();
                        if resolver.any_visible(page, &locators).await {
                            return true;
                        }
                    }
                    false
                },
                timeout,
                || Error::ReadinessTimeout { timeout },
            )
            .await;

        if let Err(e) = ready {
            tracing::warn!("Form never became ready: {}", e);
            self.transition(SessionState::Failed);
            return Err(e);
        }
        Ok(())
    }

    /// Fill every field the query carries a value for.
    ///
    /// Empty fields are never touched, not even cleared.
    pub async fn fill(&mut self, query: &Query) -> Result<FillReport> {
        self.transition(SessionState::Filling);
        let mut report = FillReport::default();

        for (field, value) in query.present_fields() {
            let written = match self.resolver.resolve(self.page, self.controls.field(field)).await {
                Some(control) => match control.fill(value).await {
                    Ok(()) => {
                        tracing::debug!("Filled {} via {}", field, control.matched_by());
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Filling {} failed: {}", field, e);
                        false
                    }
                },
                None => false,
            };

            if written {
                report.filled.push(field);
                continue;
            }

            match self.fill_policy {
                FillPolicy::Lenient => {
                    tracing::warn!("Field {} not found on page, skipping", field);
                    report.unresolved.push(field);
                }
                FillPolicy::Strict => {
                    self.transition(SessionState::Failed);
                    return Err(Error::FieldNotResolved(field.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Find and press the search button
    pub async fn submit(&mut self) -> Result<()> {
        self.transition(SessionState::Submitting);
        let button = match self
            .resolver
            .resolve_button(self.page, &self.controls.search_button)
            .await
        {
            Some(button) => button,
            None => {
                self.transition(SessionState::Failed);
                return Err(Error::SubmitControlNotFound);
            }
        };

        if let Err(e) = button.click().await {
            self.transition(SessionState::Failed);
            return Err(e);
        }
        tracing::debug!("Submitted via {}", button.matched_by());
        Ok(())
    }

    /// Race "rows appeared" against "empty-result text appeared".
    ///
    /// Whichever poll observes its condition first decides. If both see it on
    /// the same tick, rows win. Neither before the deadline is
    /// [`Error::RowWaitTimeout`], which is distinct from a zero-match answer.
    pub async fn await_outcome(&mut self) -> Result<Outcome> {
        self.transition(SessionState::AwaitingOutcome);
        let page = self.page;
        let resolver = &self.resolver;
        let extractor = &self.extractor;
        let empty_locators = &[Locator::Text(self.empty_text.clone())];
        let timeout = self.outcome_timeout;
        let waiter = self.waiter;

        // The losing poll is dropped with this block
        let outcome = {
            let rows = waiter.poll_until(move || extractor.has_rows(page), timeout);
            let empty =
                waiter.poll_until(move || resolver.any_visible(page, empty_locators), timeout);
            tokio::pin!(rows, empty);

            let mut rows_done = false;
            let mut empty_done = false;
            loop {
                tokio::select! {
                    biased;
                    seen = &mut rows, if !rows_done => {
                        if seen {
                            break Some(Outcome::Rows);
                        }
                        rows_done = true;
                    }
                    seen = &mut empty, if !empty_done => {
                        if seen {
                            break Some(Outcome::Empty);
                        }
                        empty_done = true;
                    }
                }
                if rows_done && empty_done {
                    break None;
                }
            }
        };

        match outcome {
            Some(Outcome::Rows) => {
                self.transition(SessionState::Rows);
                Ok(Outcome::Rows)
            }
            Some(Outcome::Empty) => {
                self.transition(SessionState::Empty);
                Ok(Outcome::Empty)
            }
            None => {
                self.transition(SessionState::Failed);
                Err(Error::RowWaitTimeout { timeout })
            }
        }
    }

    /// Ready, fill, submit, race, and extract on an already-loaded page.
    ///
    /// Rows that were detected but cannot be read are an
    /// [`Error::ExtractionFailed`], never an empty result.
    pub async fn run(mut self, query: &Query) -> Result<ResultSet> {
        self.await_ready().await?;
        let report = self.fill(query).await?;
        tracing::debug!(
            "Fill report: {} filled, {} unresolved",
            report.filled.len(),
            report.unresolved.len()
        );
        self.submit().await?;

        match self.await_outcome().await? {
            Outcome::Rows => {
                let result = match self.extractor.collect(self.page).await {
                    Ok(result) if !result.is_empty() => result,
                    Ok(_) => {
                        self.transition(SessionState::Failed);
                        return Err(Error::ExtractionFailed(
                            "result rows disappeared before they could be read".into(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Result rows were detected but not read: {}", e);
                        self.transition(SessionState::Failed);
                        return Err(e);
                    }
                };
                tracing::info!("Lookup matched {} record(s)", result.total_count);
                Ok(result)
            }
            Outcome::Empty => {
                tracing::info!("Lookup matched no records");
                Ok(ResultSet::empty())
            }
        }
    }

    /// Navigate to `url`, then [`run`](Self::run)
    pub async fn run_at(mut self, url: &str, query: &Query) -> Result<ResultSet> {
        self.navigate(url).await?;
        self.run(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawRow;
    use crate::testing::{Action, FakeElement, FakeFrame, FakePage};
    use tokio::time::Instant;

    fn row(cells: &[&str]) -> RawRow {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn config() -> LookupConfig {
        LookupConfig::default()
    }

    /// Portal layout: shell document with the form inside an embedded frame
    fn form_frame() -> FakeFrame {
        FakeFrame::new("form", "https://portal/app")
            .with(FakeElement::input("nombre", Some("Nombre(s)"), &["input#nombre"]))
            .with(FakeElement::input(
                "paterno",
                Some("Primer Apellido"),
                &["input#primerApellido"],
            ))
            .with(FakeElement::input(
                "materno",
                Some("Segundo Apellido"),
                &["input#segundoApellido"],
            ))
            .with(FakeElement::input("curp", Some("CURP"), &["input#curp"]))
            .with(FakeElement::button("buscar", "Buscar"))
    }

    fn shell() -> FakeFrame {
        FakeFrame::new("main", "https://portal")
    }

    #[tokio::test(start_paused = true)]
    async fn test_curp_only_fills_exactly_curp() {
        let page = FakePage::new(vec![shell(), form_frame()]);
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();

        let query = Query {
            nombre: Some(String::new()),
            paterno: None,
            materno: Some("  ".into()),
            curp: Some("ABCD800101HDFLRN09".into()),
        };
        let before = page.actions().len();
        let report = session.fill(&query).await.unwrap();
        assert_eq!(report.filled, vec![Field::Curp]);
        assert!(report.unresolved.is_empty());
        assert_eq!(
            page.fills(),
            vec![("curp".to_string(), "ABCD800101HDFLRN09".to_string())]
        );

        // Name controls were never even looked up
        let probes: Vec<_> = page.actions()[before..]
            .iter()
            .filter_map(|a| match a {
                Action::Probe { locator, .. } => Some(locator.clone()),
                _ => None,
            })
            .collect();
        assert!(!probes.is_empty());
        assert!(probes.iter().all(|p| !p.contains("Nombre") && !p.contains("Apellido")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_query_fills_in_form_order() {
        let page = FakePage::new(vec![shell(), form_frame()]);
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();
        let report = session
            .fill(&Query::by_name("Ana", "Lopez", "Ruiz"))
            .await
            .unwrap();
        assert_eq!(report.filled, vec![Field::Nombre, Field::Paterno, Field::Materno]);
        let filled: Vec<_> = page.fills().into_iter().map(|(el, _)| el).collect();
        assert_eq!(filled, vec!["nombre", "paterno", "materno"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lenient_fill_skips_missing_control() {
        let page = FakePage::new(vec![FakeFrame::new("main", "https://portal")
            .with(FakeElement::input("nombre", Some("Nombre(s)"), &[]))]);
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();
        let report = session
            .fill(&Query::by_name("Ana", "Lopez", ""))
            .await
            .unwrap();
        assert_eq!(report.filled, vec![Field::Nombre]);
        assert_eq!(report.unresolved, vec![Field::Paterno]);
        assert_eq!(session.state(), SessionState::Filling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_fill_fails_on_missing_control() {
        let page = FakePage::new(vec![FakeFrame::new("main", "https://portal")]);
        let cfg = LookupConfig {
            fill_policy: FillPolicy::Strict,
            ..config()
        };
        let mut session = FormSession::new(&page, &cfg).unwrap();
        let err = session.fill(&Query::by_curp("X")).await.unwrap_err();
        assert!(matches!(err, Error::FieldNotResolved(ref f) if f == "curp"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_waits_for_late_frame() {
        let page = FakePage::new(vec![shell()]);
        page.attach_after(Duration::from_millis(2_000), form_frame());
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();
        let start = Instant::now();
        session.await_ready().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2_000));
        assert!(start.elapsed() < Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout() {
        let page = FakePage::new(vec![shell()]);
        let cfg = LookupConfig {
            selector_timeout_ms: 3_000,
            ..config()
        };
        let mut session = FormSession::new(&page, &cfg).unwrap();
        let err = session.await_ready().await.unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_button_is_fatal() {
        let page = FakePage::new(vec![FakeFrame::new("main", "https://portal")
            .with(FakeElement::input("curp", Some("CURP"), &[]))]);
        let cfg = config();
        let err = FormSession::new(&page, &cfg)
            .unwrap()
            .run(&Query::by_curp("X"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmitControlNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_before_empty_text_is_rows() {
        let page = FakePage::new(vec![
            shell().with(FakeElement::text("msg", "Sin resultados").visible_after(1_600)),
            form_frame()
                .with_rows(vec![row(&["001", "Ana"])])
                .rows_after(1_000),
        ]);
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();
        assert_eq!(session.await_outcome().await.unwrap(), Outcome::Rows);
        assert_eq!(session.state(), SessionState::Rows);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_text_before_rows_is_empty() {
        let page = FakePage::new(vec![
            shell().with(FakeElement::text("msg", "No se encontraron registros").visible_after(1_000)),
            form_frame()
                .with_rows(vec![row(&["001", "Ana"])])
                .rows_after(1_600),
        ]);
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();
        assert_eq!(session.await_outcome().await.unwrap(), Outcome::Empty);
        assert_eq!(session.state(), SessionState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_order_decides_not_truth_order() {
        // Both conditions eventually hold; whichever appears first is detected first
        for (rows_at, text_at, expected) in [
            (250u64, 5_000u64, Outcome::Rows),
            (5_000, 250, Outcome::Empty),
            (10_000, 9_000, Outcome::Empty),
            (9_000, 10_000, Outcome::Rows),
        ] {
            let page = FakePage::new(vec![
                shell().with(FakeElement::text("msg", "sin resultados").visible_after(text_at)),
                form_frame().with_rows(vec![row(&["1"])]).rows_after(rows_at),
            ]);
            let cfg = config();
            let mut session = FormSession::new(&page, &cfg).unwrap();
            assert_eq!(session.await_outcome().await.unwrap(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_neither_outcome_is_row_wait_timeout() {
        let page = FakePage::new(vec![shell(), form_frame()]);
        let cfg = config();
        let start = Instant::now();
        let err = FormSession::new(&page, &cfg)
            .unwrap()
            .run(&Query::by_curp("ABCD800101HDFLRN09"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RowWaitTimeout { timeout } if timeout == Duration::from_millis(45_000)));
        assert!(start.elapsed() >= Duration::from_millis(45_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_result_is_success() {
        let page = FakePage::new(vec![
            shell().with(FakeElement::text("msg", "Sin resultados").visible_after(800)),
            form_frame(),
        ]);
        let cfg = config();
        let result = FormSession::new(&page, &cfg)
            .unwrap()
            .run(&Query::by_curp("ABCD800101HDFLRN09"))
            .await
            .unwrap();
        assert_eq!(result.total_count, 0);
        assert!(result.records.is_empty());
        assert_eq!(page.clicks(), vec!["buscar"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_extracts_records() {
        let page = FakePage::new(vec![
            shell(),
            form_frame()
                .with_rows(vec![
                    row(&["001", "Ana", "Lopez", "Ruiz", "F", "UNAM", "Medicina", "CDMX", "2010-05"]),
                    row(&["002", "Beto", "Diaz", "Cruz", "M", "IPN", "Derecho", "JAL", "2012"]),
                ])
                .rows_after(3_000),
        ]);
        let cfg = config();
        let result = FormSession::new(&page, &cfg)
            .unwrap()
            .run_at("https://portal", &Query::by_name("Ana", "Lopez", "Ruiz"))
            .await
            .unwrap();
        assert_eq!(result.total_count, 2);
        assert_eq!(result.cedulas, vec!["001", "002"]);
        assert_eq!(result.latest_year, Some(2012));
        assert_eq!(page.actions()[0], Action::Navigate("https://portal".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_navigation() {
        let page = FakePage::new(vec![shell()]);
        page.refuse_navigation("net::ERR_NAME_NOT_RESOLVED");
        let cfg = config();
        let err = FormSession::new(&page, &cfg)
            .unwrap()
            .run_at("https://portal", &Query::by_curp("X"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "navigation_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_rows_fail_the_session() {
        let page = FakePage::new(vec![
            shell(),
            form_frame()
                .with_rows(vec![row(&["001", "Ana"]), row(&["002", "Beto"])])
                .rows_after(1_000)
                .fail_rows("Execution context was destroyed"),
        ]);
        let cfg = config();
        let err = FormSession::new(&page, &cfg)
            .unwrap()
            .run(&Query::by_curp("X"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_race_leaves_page_untouched() {
        let page = FakePage::new(vec![
            shell().with(FakeElement::text("msg", "Sin resultados").visible_after(2_000)),
            form_frame(),
        ]);
        let cfg = config();
        let mut session = FormSession::new(&page, &cfg).unwrap();
        session.await_ready().await.unwrap();
        assert_eq!(session.await_outcome().await.unwrap(), Outcome::Empty);

        // Several ticks of polling, and not one element handed out
        let checks = page
            .actions()
            .iter()
            .filter(|a| matches!(a, Action::Check { .. }))
            .count();
        assert!(checks > 8);
        assert!(page.marks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_filled_and_clicked_controls_are_marked() {
        let page = FakePage::new(vec![
            shell().with(FakeElement::text("msg", "Sin resultados").visible_after(800)),
            form_frame(),
        ]);
        let cfg = config();
        FormSession::new(&page, &cfg)
            .unwrap()
            .run(&Query::by_curp("ABCD800101HDFLRN09"))
            .await
            .unwrap();
        assert_eq!(page.marks(), vec!["curp", "buscar"]);
    }

    #[test]
    fn test_fill_policy_parse() {
        assert_eq!("Strict".parse::<FillPolicy>().unwrap(), FillPolicy::Strict);
        assert_eq!(" lenient ".parse::<FillPolicy>().unwrap(), FillPolicy::Lenient);
        assert!("loose".parse::<FillPolicy>().is_err());
    }
}
