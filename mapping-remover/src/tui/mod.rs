//! Terminal UI for looking up and removing Dataverse attribute mappings.
//!
//! Requirements (UI):
//! - Centered window titled "Dataverse Mapping Remover"
//! - Environment page: one button per configured environment (production red, others green)
//! - Lookup page: entity and field inputs with suggestions, mapping grid, status line
//! - Bottom button row: [ Search ] [ Exit ] [ Delete Mapping ]
//! - Modal confirmation before a delete, modal messages for failures
//!
//! Note: Logging is file-only in TUI mode (stdout logging is disabled) to avoid corrupting the terminal UI.

use crate::dataverse::OrganizationService;
use crate::environment::{ConnectedEnvironment, EnvironmentSelector, NO_ENVIRONMENT_MESSAGE};
use crate::error::{ServiceError, ServiceResult};
use crate::metadata::MetadataCache;
use crate::models::mapping::{AttributeItem, DeleteOutcome, EntityItem, MappingResult};
use crate::models::settings::{AppSettings, EnvironmentConfig};
use crate::session::{self, AttributeLoad, LookupSession, OperationKind, Ticket};
use crate::utils::validation::validate_logical_name;
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use log::{debug, info, warn};
use ratatui::backend::{CrosstermBackend, TestBackend};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Margin, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};
use ratatui::Terminal;
use std::io::{self, Stdout};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

const WINDOW_TITLE: &str = "Dataverse Mapping Remover";
const MAX_SUGGESTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    SelectEnvironment,
    Connecting,
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonFocus {
    Search,
    Exit,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocusTarget {
    Entity,
    Attribute,
    Button(ButtonFocus),
    Results,
}

const FOCUS_ORDER: [FocusTarget; 6] = [
    FocusTarget::Entity,
    FocusTarget::Attribute,
    FocusTarget::Button(ButtonFocus::Search),
    FocusTarget::Button(ButtonFocus::Exit),
    FocusTarget::Button(ButtonFocus::Delete),
    FocusTarget::Results,
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Modal {
    Message {
        title: String,
        body: String,
        quit_after: bool,
    },
    ConfirmDelete {
        mapping: MappingResult,
        yes_focused: bool,
    },
}

/// Single-line editor. `cursor` counts chars, not bytes.
#[derive(Debug, Clone, Default)]
struct TextInput {
    value: String,
    cursor: usize,
}

impl TextInput {
    fn len(&self) -> usize {
        self.value.chars().count()
    }

    fn byte_index(&self, char_index: usize) -> usize {
        self.value
            .char_indices()
            .nth(char_index)
            .map(|(i, _)| i)
            .unwrap_or(self.value.len())
    }

    fn set(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.cursor = self.len();
    }

    fn clear(&mut self) {
        self.set(String::new());
    }

    /// Returns true when the key was consumed.
    fn handle_key(&mut self, code: KeyCode) -> bool {
        match code {
            KeyCode::Char(c) => {
                let at = self.byte_index(self.cursor);
                self.value.insert(at, c);
                self.cursor += 1;
                true
            }
            KeyCode::Backspace => {
                if self.cursor > 0 {
                    let at = self.byte_index(self.cursor - 1);
                    self.value.remove(at);
                    self.cursor -= 1;
                }
                true
            }
            KeyCode::Delete => {
                if self.cursor < self.len() {
                    let at = self.byte_index(self.cursor);
                    self.value.remove(at);
                }
                true
            }
            KeyCode::Left => {
                self.cursor = self.cursor.saturating_sub(1);
                true
            }
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(self.len());
                true
            }
            KeyCode::Home => {
                self.cursor = 0;
                true
            }
            KeyCode::End => {
                self.cursor = self.len();
                true
            }
            _ => false,
        }
    }
}

/// Picker entry: shown label plus the logical name it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Suggestion {
    label: String,
    value: String,
}

/// Everything the lookup page needs from a successful sign-in.
struct Connection {
    environment: String,
    account: Option<String>,
    session: Arc<LookupSession>,
}

impl Connection {
    fn open(connected: ConnectedEnvironment, batch_size: usize) -> Self {
        let service: Arc<dyn OrganizationService> = connected.client;
        let metadata = Arc::new(MetadataCache::new(service.clone(), batch_size));
        Self {
            environment: connected.environment.name,
            account: connected.account,
            session: Arc::new(LookupSession::new(service, metadata)),
        }
    }
}

enum UiMsg {
    SignInUrl {
        generation: u64,
        url: String,
    },
    Connected {
        generation: u64,
        result: ServiceResult<Connection>,
    },
    EntitiesLoaded {
        ticket: Ticket,
        result: ServiceResult<Vec<EntityItem>>,
    },
    AttributesLoaded {
        ticket: Ticket,
        result: ServiceResult<AttributeLoad>,
    },
    SearchFinished {
        ticket: Ticket,
        result: ServiceResult<Vec<MappingResult>>,
    },
    DeleteFinished {
        ticket: Ticket,
        result: ServiceResult<DeleteOutcome>,
    },
}

/// Where background work runs and how its results come back.
struct Context<'a> {
    rt: &'a Handle,
    tx: &'a mpsc::Sender<UiMsg>,
    selector: &'a Arc<EnvironmentSelector>,
}

struct AppState {
    page: Page,
    modal: Option<Modal>,
    focus: FocusTarget,
    quit: bool,

    environments: Vec<EnvironmentConfig>,
    environment_index: usize,
    connecting: Option<String>,
    sign_in_url: Option<String>,
    connect_cancel: Option<CancellationToken>,
    connect_generation: u64,

    environment_name: String,
    account: Option<String>,
    session: Option<Arc<LookupSession>>,

    entity_input: TextInput,
    entity_items: Vec<EntityItem>,
    entity_suggestion: usize,
    active_entity: Option<String>,

    attribute_input: TextInput,
    attribute_items: Vec<AttributeItem>,
    attribute_suggestion: usize,
    attributes_loaded: bool,
    /// Field list reload after a delete; keeps the delete status on screen.
    refreshing_attributes: bool,

    results: Vec<MappingResult>,
    selected_row: Option<usize>,
    status: String,
}

impl AppState {
    fn new(environments: Vec<EnvironmentConfig>) -> Self {
        Self {
            page: Page::SelectEnvironment,
            modal: None,
            focus: FocusTarget::Entity,
            quit: false,
            environments,
            environment_index: 0,
            connecting: None,
            sign_in_url: None,
            connect_cancel: None,
            connect_generation: 0,
            environment_name: String::new(),
            account: None,
            session: None,
            entity_input: TextInput::default(),
            entity_items: Vec::new(),
            entity_suggestion: 0,
            active_entity: None,
            attribute_input: TextInput::default(),
            attribute_items: Vec::new(),
            attribute_suggestion: 0,
            attributes_loaded: false,
            refreshing_attributes: false,
            results: Vec::new(),
            selected_row: None,
            status: "Ready.".to_string(),
        }
    }

    fn is_running(&self, kind: OperationKind) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_running(kind))
    }

    fn can_search(&self) -> bool {
        self.attributes_loaded && !self.is_running(OperationKind::Search)
    }

    fn can_delete(&self) -> bool {
        self.selected_mapping().is_some() && !self.is_running(OperationKind::Delete)
    }

    fn selected_mapping(&self) -> Option<&MappingResult> {
        self.selected_row.and_then(|i| self.results.get(i))
    }

    fn show_message(&mut self, title: impl Into<String>, body: impl Into<String>) {
        self.modal = Some(Modal::Message {
            title: title.into(),
            body: body.into(),
            quit_after: false,
        });
    }

    fn show_error(&mut self, err: &ServiceError) {
        let body = match err {
            ServiceError::RemoteFailure { .. } => format!("An error occurred: {}", err),
            _ => err.to_string(),
        };
        self.show_message(err.title(), body);
    }
}

fn matches_filter(filter: &str, logical: &str, display: &str) -> bool {
    filter.is_empty()
        || logical.to_lowercase().contains(filter)
        || display.to_lowercase().contains(filter)
}

fn entity_label(item: &EntityItem) -> String {
    if item.display_name == item.logical_name {
        item.logical_name.clone()
    } else {
        format!("{} ({})", item.display_name, item.logical_name)
    }
}

/// Hidden once the input names an item exactly.
fn entity_suggestions(state: &AppState) -> Vec<Suggestion> {
    let typed = state.entity_input.value.trim();
    if state
        .entity_items
        .iter()
        .any(|i| i.logical_name.eq_ignore_ascii_case(typed))
    {
        return Vec::new();
    }
    let filter = typed.to_lowercase();
    state
        .entity_items
        .iter()
        .filter(|i| matches_filter(&filter, &i.logical_name, &i.display_name))
        .take(MAX_SUGGESTIONS)
        .map(|i| Suggestion {
            label: entity_label(i),
            value: i.logical_name.clone(),
        })
        .collect()
}

fn attribute_suggestions(state: &AppState) -> Vec<Suggestion> {
    let typed = state.attribute_input.value.trim();
    if !state.attributes_loaded
        || state
            .attribute_items
            .iter()
            .any(|i| i.logical_name.eq_ignore_ascii_case(typed))
    {
        return Vec::new();
    }
    let filter = typed.to_lowercase();
    state
        .attribute_items
        .iter()
        .filter(|i| matches_filter(&filter, &i.logical_name, &i.display_name))
        .take(MAX_SUGGESTIONS)
        .map(|i| Suggestion {
            label: i.to_string(),
            value: i.logical_name.clone(),
        })
        .collect()
}

pub fn run(selector: Arc<EnvironmentSelector>, preselect: Option<String>) -> Result<()> {
    info!("[PHASE: tui] [STEP: start] Starting mapping lookup TUI");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let mut terminal = setup_terminal()?;
    let result = run_loop(&mut terminal, rt.handle(), &selector, preselect);
    restore_terminal(&mut terminal)?;

    rt.shutdown_timeout(Duration::from_secs(2));
    result
}

fn sample_mappings() -> Vec<MappingResult> {
    use crate::models::mapping::MappingDirection;
    vec![
        MappingResult {
            source_entity: "contact".to_string(),
            source_attribute: "emailaddress1".to_string(),
            target_entity: "lead".to_string(),
            target_attribute: "emailaddress1".to_string(),
            entity_map_id: uuid::Uuid::from_u128(0x1a2b_3c4d_0000_0000_0000_0000_0000_0001),
            attribute_map_id: uuid::Uuid::from_u128(0x5e6f_7a8b_0000_0000_0000_0000_0000_0002),
            direction: MappingDirection::SourceToTarget,
        },
        MappingResult {
            source_entity: "lead".to_string(),
            source_attribute: "emailaddress1".to_string(),
            target_entity: "contact".to_string(),
            target_attribute: "emailaddress1".to_string(),
            entity_map_id: uuid::Uuid::from_u128(0x1a2b_3c4d_0000_0000_0000_0000_0000_0003),
            attribute_map_id: uuid::Uuid::from_u128(0x5e6f_7a8b_0000_0000_0000_0000_0000_0004),
            direction: MappingDirection::TargetToSource,
        },
    ]
}

fn new_smoke_state(target: &str) -> AppState {
    // Smoke-only: seeded state for deterministic page rendering.
    let mut state = AppState::new(AppSettings::default().environments);
    match target {
        "connecting" => {
            state.page = Page::Connecting;
            state.connecting = Some("Sandbox".to_string());
            state.sign_in_url = Some(
                "https://login.microsoftonline.com/organizations/oauth2/v2.0/authorize?client_id=..."
                    .to_string(),
            );
        }
        "lookup" | "results" | "confirm" | "message" => {
            state.page = Page::Lookup;
            state.environment_name = "Sandbox".to_string();
            state.account = Some("admin@contoso.onmicrosoft.com".to_string());
            state.entity_items = vec![
                EntityItem {
                    logical_name: "contact".to_string(),
                    display_name: "Contact".to_string(),
                },
                EntityItem {
                    logical_name: "lead".to_string(),
                    display_name: "Lead".to_string(),
                },
            ];
            state.status = "Entities loaded.".to_string();
            if target != "lookup" {
                state.entity_input.set("contact");
                state.active_entity = Some("contact".to_string());
                state.attribute_input.set("emailaddress1");
                state.attribute_items = vec![AttributeItem {
                    logical_name: "emailaddress1".to_string(),
                    display_name: "Email".to_string(),
                }];
                state.attributes_loaded = true;
                state.results = sample_mappings();
                state.selected_row = Some(0);
                state.focus = FocusTarget::Results;
                state.status = session::search_status(state.results.len());
            }
            if target == "confirm" {
                state.modal = Some(Modal::ConfirmDelete {
                    mapping: state.results[0].clone(),
                    yes_focused: false,
                });
            }
            if target == "message" {
                state.show_message(
                    "Delete Failed",
                    "Failed to delete mapping.\n\nPrincipal user is missing prvDeleteAttributeMap privilege (HTTP 403)",
                );
                state.status = "Delete Failed.".to_string();
            }
        }
        _ => {}
    }
    state
}

pub fn smoke(target: &str) -> Result<()> {
    info!(
        "[PHASE: tui] [STEP: smoke] Rendering single-frame TUI smoke target={}",
        target
    );

    let t = target.trim().to_ascii_lowercase();
    let state = new_smoke_state(t.as_str());

    // In-memory backend: no raw mode or alternate screen.
    let backend = TestBackend::new(100, 30);
    let mut terminal = Terminal::new(backend)?;
    terminal.draw(|f| draw(f.size(), f, &state))?;

    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    rt: &Handle,
    selector: &Arc<EnvironmentSelector>,
    preselect: Option<String>,
) -> Result<()> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut state = AppState::new(selector.environments().to_vec());
    let (tx, rx) = mpsc::channel::<UiMsg>();
    let ctx = Context {
        rt,
        tx: &tx,
        selector,
    };

    if let Some(name) = preselect {
        preselect_environment(&mut state, &ctx, &name);
    }

    while !state.quit {
        drain_messages(&mut state, &ctx, &rx);
        terminal.draw(|f| draw(f.size(), f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_millis(0));

        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    handle_key(&mut state, key.code, &ctx)
                }
                _ => {}
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }

    if let Some(session) = &state.session {
        session.cancel_all();
    }
    if let Some(token) = &state.connect_cancel {
        token.cancel();
    }
    info!("[PHASE: tui] [STEP: exit] TUI closed");
    Ok(())
}

fn preselect_environment(state: &mut AppState, ctx: &Context<'_>, name: &str) {
    match state
        .environments
        .iter()
        .position(|e| e.name.eq_ignore_ascii_case(name.trim()))
    {
        Some(index) => {
            state.environment_index = index;
            start_connect(state, ctx, index);
        }
        None => {
            warn!("[PHASE: tui] [STEP: preselect] Unknown environment '{}'", name);
            state.show_message(
                "Unknown Environment",
                format!("Environment '{}' is not configured.", name.trim()),
            );
        }
    }
}

fn drain_messages(state: &mut AppState, ctx: &Context<'_>, rx: &mpsc::Receiver<UiMsg>) {
    while let Ok(msg) = rx.try_recv() {
        apply_message(state, ctx, msg);
    }
}

/// Claims `ticket`'s slot. False when the result is stale and must be dropped.
fn accept(state: &AppState, ticket: &Ticket) -> bool {
    let Some(session) = &state.session else {
        return false;
    };
    if state.page != Page::Lookup || !session.is_current(ticket) {
        debug!(
            "[PHASE: tui] [STEP: stale] Dropping {:?} #{}",
            ticket.kind, ticket.generation
        );
        return false;
    }
    session.finish(ticket);
    true
}

fn apply_message(state: &mut AppState, ctx: &Context<'_>, msg: UiMsg) {
    match msg {
        UiMsg::SignInUrl { generation, url } => {
            if generation == state.connect_generation && state.page == Page::Connecting {
                state.sign_in_url = Some(url);
            }
        }
        UiMsg::Connected { generation, result } => {
            if generation != state.connect_generation || state.page != Page::Connecting {
                return;
            }
            state.connect_cancel = None;
            match result {
                Ok(connection) => {
                    state.page = Page::Lookup;
                    state.focus = FocusTarget::Entity;
                    state.environment_name = connection.environment;
                    state.account = connection.account;
                    state.session = Some(connection.session);
                    start_load_entities(state, ctx);
                }
                Err(ServiceError::Cancelled) => {
                    state.page = Page::SelectEnvironment;
                }
                Err(e) => {
                    warn!("[PHASE: tui] [STEP: connect] {}", e);
                    state.page = Page::SelectEnvironment;
                    state.show_message("Connection Failed", e.to_string());
                }
            }
        }
        UiMsg::EntitiesLoaded { ticket, result } => {
            if !accept(state, &ticket) {
                return;
            }
            match result {
                Ok(items) => {
                    state.entity_items = items;
                    state.entity_suggestion = 0;
                    state.status = "Entities loaded.".to_string();
                }
                Err(ServiceError::Cancelled) => {}
                Err(e) => {
                    state.status = "Loading entities failed.".to_string();
                    state.show_error(&e);
                }
            }
        }
        UiMsg::AttributesLoaded { ticket, result } => {
            if !accept(state, &ticket) {
                return;
            }
            match result {
                Ok(load) => {
                    let still_selected = state
                        .active_entity
                        .as_deref()
                        .is_some_and(|a| a.eq_ignore_ascii_case(&load.table));
                    if !still_selected {
                        return;
                    }
                    if !std::mem::take(&mut state.refreshing_attributes) {
                        state.status = if load.from_cache {
                            format!("Attributes for {} loaded from cache.", load.table)
                        } else {
                            format!("Attributes for {} loaded.", load.table)
                        };
                    }
                    state.attribute_items = load.items;
                    state.attribute_suggestion = 0;
                    state.attributes_loaded = true;
                }
                Err(ServiceError::Cancelled) => {}
                Err(e) => {
                    state.refreshing_attributes = false;
                    state.status = "Loading attributes failed.".to_string();
                    state.show_error(&e);
                }
            }
        }
        UiMsg::SearchFinished { ticket, result } => {
            if !accept(state, &ticket) {
                return;
            }
            match result {
                Ok(found) => {
                    state.status = session::search_status(found.len());
                    state.selected_row = if found.is_empty() { None } else { Some(0) };
                    state.results = found;
                    if state.selected_row.is_some() {
                        state.focus = FocusTarget::Results;
                    }
                }
                Err(ServiceError::Cancelled) => {
                    state.status = "Search canceled.".to_string();
                }
                Err(e) => {
                    state.status = "Search failed.".to_string();
                    state.show_error(&e);
                }
            }
        }
        UiMsg::DeleteFinished { ticket, result } => {
            if !accept(state, &ticket) {
                return;
            }
            match result {
                Ok(outcome) => {
                    let touched_active = state
                        .results
                        .iter()
                        .find(|m| m.attribute_map_id == outcome.attribute_map_id)
                        .zip(state.active_entity.as_deref())
                        .is_some_and(|(m, active)| {
                            m.source_entity.eq_ignore_ascii_case(active)
                                || m.target_entity.eq_ignore_ascii_case(active)
                        });
                    state
                        .results
                        .retain(|m| m.attribute_map_id != outcome.attribute_map_id);
                    state.selected_row = match state.selected_row {
                        _ if state.results.is_empty() => None,
                        Some(i) => Some(i.min(state.results.len() - 1)),
                        None => None,
                    };
                    if touched_active {
                        if let Some(table) = state.active_entity.clone() {
                            start_load_attributes(state, ctx, table);
                            state.refreshing_attributes = true;
                        }
                    }
                    state.status = "Mapping deleted.".to_string();
                }
                Err(e) => {
                    warn!("[PHASE: tui] [STEP: delete] {}", e);
                    state.show_message(
                        "Delete Failed",
                        format!("Failed to delete mapping.\n\n{}", e),
                    );
                    state.status = "Delete Failed.".to_string();
                }
            }
        }
    }
}

fn start_connect(state: &mut AppState, ctx: &Context<'_>, index: usize) {
    let Some(environment) = state.environments.get(index).cloned() else {
        return;
    };
    info!(
        "[PHASE: tui] [STEP: connect] Environment selected: {}",
        environment.name
    );

    state.connect_generation += 1;
    let generation = state.connect_generation;
    let token = CancellationToken::new();
    state.connect_cancel = Some(token.clone());
    state.connecting = Some(environment.name.clone());
    state.sign_in_url = None;
    state.page = Page::Connecting;

    let selector = ctx.selector.clone();
    let tx = ctx.tx.clone();
    ctx.rt.spawn(async move {
        let url_tx = tx.clone();
        let on_url = move |url: &str| {
            let _ = url_tx.send(UiMsg::SignInUrl {
                generation,
                url: url.to_string(),
            });
        };
        let batch_size = selector.settings().metadata_batch_size;
        let result = selector
            .connect(&environment, on_url, &token)
            .await
            .map(|connected| Connection::open(connected, batch_size));
        let _ = tx.send(UiMsg::Connected { generation, result });
    });
}

fn start_load_entities(state: &mut AppState, ctx: &Context<'_>) {
    let Some(session) = state.session.clone() else {
        return;
    };
    let ticket = session.begin(OperationKind::Entities);
    state.status = "Loading entities ...".to_string();

    let tx = ctx.tx.clone();
    ctx.rt.spawn(async move {
        let result = session.load_entities(&ticket).await;
        let _ = tx.send(UiMsg::EntitiesLoaded { ticket, result });
    });
}

fn start_load_attributes(state: &mut AppState, ctx: &Context<'_>, table: String) {
    let Some(session) = state.session.clone() else {
        return;
    };
    let ticket = session.begin(OperationKind::Attributes);
    state.refreshing_attributes = false;
    state.status = format!("Loading attributes for {}...", table);

    let tx = ctx.tx.clone();
    ctx.rt.spawn(async move {
        let result = session.load_attributes(&table, &ticket).await;
        let _ = tx.send(UiMsg::AttributesLoaded { ticket, result });
    });
}

fn start_search(state: &mut AppState, ctx: &Context<'_>) {
    if !state.can_search() {
        return;
    }
    let Some(session) = state.session.clone() else {
        return;
    };
    let table = state.entity_input.value.clone();
    let field = state.attribute_input.value.clone();
    info!(
        "[PHASE: tui] [STEP: search] Searching mappings for {}.{}",
        table, field
    );

    let ticket = session.begin(OperationKind::Search);
    state.results.clear();
    state.selected_row = None;
    state.status = "Searching for mappings ...".to_string();

    let tx = ctx.tx.clone();
    ctx.rt.spawn(async move {
        let result = session.search(&table, &field, &ticket).await;
        let _ = tx.send(UiMsg::SearchFinished { ticket, result });
    });
}

fn start_delete(state: &mut AppState, ctx: &Context<'_>, mapping: MappingResult) {
    let Some(session) = state.session.clone() else {
        return;
    };
    info!(
        "[PHASE: tui] [STEP: delete] Delete confirmed for {} ({})",
        mapping.describe(),
        mapping.attribute_map_id
    );

    let ticket = session.begin(OperationKind::Delete);
    state.status = "Deleting mapping ...".to_string();

    let tx = ctx.tx.clone();
    ctx.rt.spawn(async move {
        let result = session.delete(&mapping, &ticket).await;
        let _ = tx.send(UiMsg::DeleteFinished { ticket, result });
    });
}

/// Drops the chosen entity with its field list and grid.
fn clear_entity_selection(state: &mut AppState) {
    if let Some(session) = &state.session {
        session.cancel(OperationKind::Attributes);
        session.cancel(OperationKind::Search);
    }
    state.active_entity = None;
    state.attributes_loaded = false;
    state.refreshing_attributes = false;
    state.attribute_items.clear();
    state.attribute_input.clear();
    state.attribute_suggestion = 0;
    state.results.clear();
    state.selected_row = None;
}

fn commit_entity(state: &mut AppState, ctx: &Context<'_>) {
    let suggestions = entity_suggestions(state);
    let chosen = suggestions
        .get(state.entity_suggestion)
        .map(|s| s.value.clone())
        .unwrap_or_else(|| state.entity_input.value.clone());
    let logical = match validate_logical_name(&chosen, "Entity logical name") {
        Ok(v) => v,
        Err(e) => {
            state.show_error(&e);
            return;
        }
    };

    state.entity_input.set(logical.clone());
    state.focus = FocusTarget::Attribute;
    let unchanged = state.active_entity.as_deref() == Some(logical.as_str());
    if unchanged && (state.attributes_loaded || state.is_running(OperationKind::Attributes)) {
        return;
    }
    clear_entity_selection(state);
    state.active_entity = Some(logical.clone());
    start_load_attributes(state, ctx, logical);
}

/// Enter on the field input: pick the highlighted suggestion, or search when none is offered.
fn commit_attribute(state: &mut AppState, ctx: &Context<'_>) {
    let suggestions = attribute_suggestions(state);
    match suggestions.get(state.attribute_suggestion) {
        Some(s) => {
            state.attribute_input.set(s.value.clone());
            state.focus = FocusTarget::Button(ButtonFocus::Search);
        }
        None => start_search(state, ctx),
    }
}

fn request_delete(state: &mut AppState) {
    if state.is_running(OperationKind::Delete) {
        return;
    }
    match state.selected_mapping() {
        Some(mapping) => {
            state.modal = Some(Modal::ConfirmDelete {
                mapping: mapping.clone(),
                yes_focused: false,
            });
        }
        None => state.show_message(
            "Delete Mapping Error",
            "Please select exactly one mapping row to delete.",
        ),
    }
}

fn exit(state: &mut AppState) {
    if let Some(session) = &state.session {
        session.cancel_all();
    }
    state.quit = true;
}

fn move_focus(state: &mut AppState, forward: bool) {
    let pos = FOCUS_ORDER
        .iter()
        .position(|f| *f == state.focus)
        .unwrap_or(0);
    let len = FOCUS_ORDER.len();
    let next = if forward {
        (pos + 1) % len
    } else {
        (pos + len - 1) % len
    };
    state.focus = FOCUS_ORDER[next];
}

fn cycle(index: usize, len: usize, forward: bool) -> usize {
    if len == 0 {
        return 0;
    }
    if forward {
        (index + 1) % len
    } else {
        (index + len - 1) % len
    }
}

fn handle_key(state: &mut AppState, code: KeyCode, ctx: &Context<'_>) {
    // Modal handling
    if let Some(modal) = state.modal.clone() {
        match modal {
            Modal::Message { quit_after, .. } => {
                if matches!(code, KeyCode::Enter | KeyCode::Esc) {
                    state.modal = None;
                    if quit_after {
                        exit(state);
                    }
                }
            }
            Modal::ConfirmDelete {
                mapping,
                yes_focused,
            } => match code {
                KeyCode::Left | KeyCode::Right | KeyCode::Tab | KeyCode::BackTab => {
                    state.modal = Some(Modal::ConfirmDelete {
                        mapping,
                        yes_focused: !yes_focused,
                    });
                }
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    state.modal = None;
                    start_delete(state, ctx, mapping);
                }
                KeyCode::Enter => {
                    state.modal = None;
                    if yes_focused {
                        start_delete(state, ctx, mapping);
                    }
                }
                KeyCode::Esc | KeyCode::Char('n') | KeyCode::Char('N') => {
                    state.modal = None;
                }
                _ => {}
            },
        }
        return;
    }

    match state.page {
        Page::SelectEnvironment => match code {
            KeyCode::Up | KeyCode::Left | KeyCode::BackTab => {
                state.environment_index =
                    cycle(state.environment_index, state.environments.len(), false);
            }
            KeyCode::Down | KeyCode::Right | KeyCode::Tab => {
                state.environment_index =
                    cycle(state.environment_index, state.environments.len(), true);
            }
            KeyCode::Enter => start_connect(state, ctx, state.environment_index),
            KeyCode::Esc => {
                info!("[PHASE: tui] [STEP: select] {}", NO_ENVIRONMENT_MESSAGE);
                state.modal = Some(Modal::Message {
                    title: "Select an Environment".to_string(),
                    body: NO_ENVIRONMENT_MESSAGE.to_string(),
                    quit_after: true,
                });
            }
            _ => {}
        },
        Page::Connecting => {
            if code == KeyCode::Esc {
                if let Some(token) = state.connect_cancel.take() {
                    token.cancel();
                }
                // Late results from the abandoned attempt carry the old generation.
                state.connect_generation += 1;
                state.connecting = None;
                state.sign_in_url = None;
                state.page = Page::SelectEnvironment;
            }
        }
        Page::Lookup => handle_lookup_key(state, code, ctx),
    }
}

fn handle_lookup_key(state: &mut AppState, code: KeyCode, ctx: &Context<'_>) {
    match code {
        KeyCode::Esc => {
            if let Some(session) = &state.session {
                if session.cancel(OperationKind::Search) {
                    info!("[PHASE: tui] [STEP: search] Search canceled by user");
                    state.status = "Search canceled.".to_string();
                }
            }
            return;
        }
        KeyCode::Tab => {
            move_focus(state, true);
            return;
        }
        KeyCode::BackTab => {
            move_focus(state, false);
            return;
        }
        _ => {}
    }

    match state.focus {
        FocusTarget::Entity => match code {
            KeyCode::Enter => commit_entity(state, ctx),
            KeyCode::Up => {
                let n = entity_suggestions(state).len();
                state.entity_suggestion = cycle(state.entity_suggestion, n, false);
            }
            KeyCode::Down => {
                let n = entity_suggestions(state).len();
                state.entity_suggestion = cycle(state.entity_suggestion, n, true);
            }
            other => {
                let before = state.entity_input.value.clone();
                state.entity_input.handle_key(other);
                if state.entity_input.value != before {
                    state.entity_suggestion = 0;
                    let still_selected = state
                        .active_entity
                        .as_deref()
                        .is_some_and(|a| a.eq_ignore_ascii_case(state.entity_input.value.trim()));
                    if state.active_entity.is_some() && !still_selected {
                        clear_entity_selection(state);
                    }
                }
            }
        },
        FocusTarget::Attribute => match code {
            KeyCode::Enter => commit_attribute(state, ctx),
            KeyCode::Up => {
                let n = attribute_suggestions(state).len();
                state.attribute_suggestion = cycle(state.attribute_suggestion, n, false);
            }
            KeyCode::Down => {
                let n = attribute_suggestions(state).len();
                state.attribute_suggestion = cycle(state.attribute_suggestion, n, true);
            }
            other => {
                let before = state.attribute_input.value.clone();
                state.attribute_input.handle_key(other);
                if state.attribute_input.value != before {
                    state.attribute_suggestion = 0;
                }
            }
        },
        FocusTarget::Button(b) => match code {
            KeyCode::Left | KeyCode::Right => {
                let buttons = [ButtonFocus::Search, ButtonFocus::Exit, ButtonFocus::Delete];
                let pos = buttons.iter().position(|x| *x == b).unwrap_or(0);
                let next = cycle(pos, buttons.len(), code == KeyCode::Right);
                state.focus = FocusTarget::Button(buttons[next]);
            }
            KeyCode::Enter => match b {
                ButtonFocus::Search => start_search(state, ctx),
                ButtonFocus::Exit => exit(state),
                ButtonFocus::Delete => request_delete(state),
            },
            _ => {}
        },
        FocusTarget::Results => match code {
            KeyCode::Up => {
                if let Some(i) = state.selected_row {
                    state.selected_row = Some(i.saturating_sub(1));
                }
            }
            KeyCode::Down => {
                state.selected_row = match state.selected_row {
                    Some(i) => Some((i + 1).min(state.results.len().saturating_sub(1))),
                    None if !state.results.is_empty() => Some(0),
                    None => None,
                };
            }
            KeyCode::Enter | KeyCode::Delete => request_delete(state),
            _ => {}
        },
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame<'_>, state: &AppState) {
    let (window_area, _) = centered_window(area, 100, 30);

    let title = match state.page {
        Page::Lookup => match &state.account {
            Some(account) => format!(
                "{} - {} ({})",
                WINDOW_TITLE, state.environment_name, account
            ),
            None => format!("{} - {}", WINDOW_TITLE, state.environment_name),
        },
        _ => WINDOW_TITLE.to_string(),
    };
    f.render_widget(Block::default().borders(Borders::ALL).title(title), window_area);

    let inner = window_area.inner(&Margin {
        vertical: 1,
        horizontal: 1,
    });
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1), Constraint::Length(1)].as_ref())
        .split(inner);

    let body = rows[0];
    let status = rows[1];
    let buttons = rows[2];

    match state.page {
        Page::SelectEnvironment => {
            draw_environment_page(f, body, state);
            let hint = Paragraph::new("Up/Down: choose  Enter: connect  Esc: exit")
                .style(Style::default().fg(Color::DarkGray));
            f.render_widget(hint, buttons);
        }
        Page::Connecting => {
            draw_connecting_page(f, body, state);
            let hint =
                Paragraph::new("Esc: cancel").style(Style::default().fg(Color::DarkGray));
            f.render_widget(hint, buttons);
        }
        Page::Lookup => {
            draw_lookup_page(f, body, state);
            f.render_widget(Paragraph::new(state.status.as_str()), status);
            draw_buttons(f, buttons, state);
        }
    }

    match &state.modal {
        Some(Modal::Message { title, body, .. }) => {
            draw_message_modal(f, window_area, title, body);
        }
        Some(Modal::ConfirmDelete {
            mapping,
            yes_focused,
        }) => draw_confirm_delete_modal(f, window_area, mapping, *yes_focused),
        None => {}
    }
}

fn centered_window(area: Rect, width: u16, height: u16) -> (Rect, Rect) {
    let w = width.min(area.width.saturating_sub(2)).max(60);
    let h = height.min(area.height.saturating_sub(2)).max(20);
    let x = area.x + (area.width.saturating_sub(w)) / 2;
    let y = area.y + (area.height.saturating_sub(h)) / 2;
    let rect = Rect {
        x,
        y,
        width: w.min(area.width),
        height: h.min(area.height),
    };
    (rect, rect)
}

fn environment_button(env: &EnvironmentConfig, focused: bool) -> Span<'static> {
    let bg = if env.production {
        Color::Rgb(255, 15, 15)
    } else {
        Color::Rgb(76, 114, 41)
    };
    let mut style = Style::default().fg(Color::White).bg(bg);
    if focused {
        style = style.add_modifier(Modifier::BOLD | Modifier::UNDERLINED);
    }
    Span::styled(format!("[ {:^20} ]", env.name), style)
}

fn draw_environment_page(f: &mut ratatui::Frame<'_>, area: Rect, state: &AppState) {
    let mut lines = vec![
        Line::from("Select the environment you want to connect to:"),
        Line::from(""),
    ];
    for (i, env) in state.environments.iter().enumerate() {
        let focused = i == state.environment_index;
        lines.push(Line::from(vec![
            Span::raw(if focused { "> " } else { "  " }),
            environment_button(env, focused),
            Span::raw("  "),
            Span::styled(env.base_url().to_string(), Style::default().fg(Color::DarkGray)),
        ]));
        lines.push(Line::from(""));
    }
    if state.environments.is_empty() {
        lines.push(Line::from("No environments are configured."));
    }

    let p = Paragraph::new(Text::from(lines))
        .block(Block::default().borders(Borders::ALL).title("Select an Environment"))
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);
}

fn draw_connecting_page(f: &mut ratatui::Frame<'_>, area: Rect, state: &AppState) {
    let name = state.connecting.as_deref().unwrap_or("environment");
    let mut lines = vec![Line::from(format!("Connecting to {} ...", name)), Line::from("")];
    match &state.sign_in_url {
        Some(url) => {
            lines.push(Line::from(
                "Sign in with your browser. If it did not open, visit:",
            ));
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                url.clone(),
                Style::default().fg(Color::Cyan),
            )));
        }
        None => lines.push(Line::from("Acquiring a token ...")),
    }

    let p = Paragraph::new(Text::from(lines))
        .block(Block::default().borders(Borders::ALL).title("Sign In"))
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);
}

fn input_block(title: &str, focused: bool, enabled: bool) -> Block<'static> {
    let mut style = Style::default();
    if !enabled {
        style = style.fg(Color::DarkGray);
    } else if focused {
        style = style.fg(Color::Yellow);
    }
    Block::default()
        .borders(Borders::ALL)
        .border_style(style)
        .title(title.to_string())
}

fn draw_lookup_page(f: &mut ratatui::Frame<'_>, area: Rect, state: &AppState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(2)].as_ref())
        .split(area);
    let inputs = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(rows[0]);

    let entity_focused = state.focus == FocusTarget::Entity && state.modal.is_none();
    let attribute_focused = state.focus == FocusTarget::Attribute && state.modal.is_none();

    let entity = Paragraph::new(state.entity_input.value.as_str()).block(input_block(
        "Entity",
        entity_focused,
        true,
    ));
    f.render_widget(entity, inputs[0]);

    let field_title = if state.attributes_loaded {
        "Field".to_string()
    } else {
        "Field (choose an entity first)".to_string()
    };
    let attribute = Paragraph::new(state.attribute_input.value.as_str()).block(input_block(
        &field_title,
        attribute_focused,
        state.attributes_loaded,
    ));
    f.render_widget(attribute, inputs[1]);

    draw_results(f, rows[1], state);

    let detail = match state.selected_mapping() {
        Some(m) => vec![
            Line::from(format!("Entity Mapping ID:    {}", m.entity_map_id)),
            Line::from(format!("Attribute Mapping ID: {}", m.attribute_map_id)),
        ],
        None => vec![Line::from(Span::styled(
            "Tab: move focus  Up/Down: choose  Enter: select  Esc: cancel search",
            Style::default().fg(Color::DarkGray),
        ))],
    };
    f.render_widget(Paragraph::new(Text::from(detail)), rows[2]);

    // Suggestions overlay the grid below the focused input.
    if entity_focused {
        draw_suggestions(f, inputs[0], rows[1], &entity_suggestions(state), state.entity_suggestion);
        set_input_cursor(f, inputs[0], &state.entity_input);
    } else if attribute_focused {
        draw_suggestions(
            f,
            inputs[1],
            rows[1],
            &attribute_suggestions(state),
            state.attribute_suggestion,
        );
        set_input_cursor(f, inputs[1], &state.attribute_input);
    }
}

fn set_input_cursor(f: &mut ratatui::Frame<'_>, input_area: Rect, input: &TextInput) {
    let max = input_area.width.saturating_sub(3);
    let offset = (input.cursor as u16).min(max);
    f.set_cursor(input_area.x + 1 + offset, input_area.y + 1);
}

fn draw_suggestions(
    f: &mut ratatui::Frame<'_>,
    input_area: Rect,
    below: Rect,
    suggestions: &[Suggestion],
    selected: usize,
) {
    if suggestions.is_empty() {
        return;
    }
    let height = (suggestions.len() as u16 + 2).min(below.height);
    let area = Rect {
        x: input_area.x,
        y: below.y,
        width: input_area.width,
        height,
    };
    let lines: Vec<Line> = suggestions
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let style = if i == selected {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            Line::from(Span::styled(s.label.clone(), style))
        })
        .collect();
    f.render_widget(Clear, area);
    f.render_widget(
        Paragraph::new(Text::from(lines)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn draw_results(f: &mut ratatui::Frame<'_>, area: Rect, state: &AppState) {
    let header = Row::new(vec![
        "Source Entity",
        "Source Field",
        "Target Entity",
        "Target Field",
        "Entity Mapping ID",
        "Attribute Mapping ID",
        "Mapping Direction",
    ])
    .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = state
        .results
        .iter()
        .map(|m| {
            Row::new(vec![
                Cell::from(m.source_entity.clone()),
                Cell::from(m.source_attribute.clone()),
                Cell::from(m.target_entity.clone()),
                Cell::from(m.target_attribute.clone()),
                Cell::from(m.entity_map_id.to_string()),
                Cell::from(m.attribute_map_id.to_string()),
                Cell::from(m.direction.as_str()),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(13),
        Constraint::Length(14),
        Constraint::Length(13),
        Constraint::Length(14),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Min(16),
    ];
    let focused = state.focus == FocusTarget::Results && state.modal.is_none();
    let table = Table::new(rows, widths)
        .header(header)
        .column_spacing(1)
        .block(input_block("Mappings", focused, true))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));

    let mut table_state = TableState::default().with_selected(state.selected_row);
    f.render_stateful_widget(table, area, &mut table_state);
}

fn draw_buttons(f: &mut ratatui::Frame<'_>, area: Rect, state: &AppState) {
    let search = button_text(
        "Search",
        state.focus == FocusTarget::Button(ButtonFocus::Search),
        state.can_search(),
    );
    let exit = button_text(
        "Exit",
        state.focus == FocusTarget::Button(ButtonFocus::Exit),
        true,
    );
    let delete = button_text(
        "Delete Mapping",
        state.focus == FocusTarget::Button(ButtonFocus::Delete),
        state.can_delete(),
    );

    let line = Line::from(vec![search, Span::raw(" "), exit, Span::raw(" "), delete]);
    let p = Paragraph::new(Text::from(line)).alignment(Alignment::Right);
    f.render_widget(p, area);
}

fn button_text(label: &str, focused: bool, enabled: bool) -> Span<'static> {
    let mut style = Style::default();
    if !enabled {
        style = style.fg(Color::DarkGray);
    }
    if focused {
        style = style.add_modifier(Modifier::REVERSED);
    }
    Span::styled(format!("[ {} ]", label), style)
}

fn modal_area(window_area: Rect, width: u16, height: u16) -> Rect {
    let modal_w = width.min(window_area.width.saturating_sub(4)).max(40);
    let modal_h = height.min(window_area.height.saturating_sub(4)).max(7);
    Rect {
        x: window_area.x + (window_area.width.saturating_sub(modal_w)) / 2,
        y: window_area.y + (window_area.height.saturating_sub(modal_h)) / 2,
        width: modal_w,
        height: modal_h,
    }
}

fn modal_buttons_area(area: Rect) -> Rect {
    Rect {
        x: area.x + 1,
        y: area.y + area.height - 2,
        width: area.width - 2,
        height: 1,
    }
}

fn draw_message_modal(f: &mut ratatui::Frame<'_>, window_area: Rect, title: &str, body: &str) {
    let area = modal_area(window_area, 70, 10);
    f.render_widget(Clear, area);

    let block = Block::default().borders(Borders::ALL).title(title.to_string());
    let p = Paragraph::new(Text::from(body.to_string()))
        .block(block)
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);

    let ok = Span::styled("[ OK ]", Style::default().add_modifier(Modifier::REVERSED));
    let p = Paragraph::new(Text::from(Line::from(vec![ok]))).alignment(Alignment::Right);
    f.render_widget(p, modal_buttons_area(area));
}

fn draw_confirm_delete_modal(
    f: &mut ratatui::Frame<'_>,
    window_area: Rect,
    mapping: &MappingResult,
    yes_focused: bool,
) {
    let area = modal_area(window_area, 72, 11);
    f.render_widget(Clear, area);

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Confirm Deletion")
        .border_style(Style::default().fg(Color::Yellow));
    let body = Paragraph::new(Text::from(vec![
        Line::from("Delete mapping:"),
        Line::from(""),
        Line::from(Span::styled(
            mapping.describe(),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from("This will remove the field-level mapping (attributemap). Continue?"),
    ]))
    .block(block)
    .wrap(Wrap { trim: false });
    f.render_widget(body, area);

    // Buttons: [ Yes ] [ No ] (No is the default)
    let yes = button_text("Yes", yes_focused, true);
    let no = button_text("No", !yes_focused, true);
    let line = Line::from(vec![yes, Span::raw(" "), no]);
    let p = Paragraph::new(Text::from(line)).alignment(Alignment::Right);
    f.render_widget(p, modal_buttons_area(area));
}
