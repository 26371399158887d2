//! Stepper / step-group engine.
//!
//! Executes an ordered list of named steps against a context, one at a time:
//! the engine does not advance until the current step's completion callback
//! fires. Step groups may carry an iterator that repeats the inner sequence
//! once per element of a dynamically-discovered collection. Cancellation is
//! cooperative, checked between steps; a failing step aborts the remainder
//! and surfaces its error unchanged, tagged with the step's full-qualified
//! id.

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::properties::PropertiesContainer;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies one step occurrence across nested iteration groups, e.g.
/// `launch/targets@1/attach`. Used as the key namespace for step-local data
/// in the shared properties container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullQualifiedId {
    segments: Vec<String>,
}

impl FullQualifiedId {
    /// Root id.
    pub fn new(root: impl Into<String>) -> Self {
        Self { segments: vec![root.into()] }
    }

    /// Append a child segment.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self { segments }
    }

    /// Tag the last segment with a 0-based iteration index.
    #[must_use]
    pub fn iteration(&self, index: usize) -> Self {
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            last.push_str(&format!("@{index}"));
        }
        Self { segments }
    }

    /// The id as a properties-container scope key.
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FullQualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// The properties container shared by all steps of one run.
#[derive(Debug, Clone, Default)]
pub struct SharedProperties(Arc<Mutex<PropertiesContainer>>);

impl SharedProperties {
    /// Wrap an initial container.
    pub fn new(initial: PropertiesContainer) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    /// Run `f` with exclusive access to the container.
    pub fn with<R>(&self, f: impl FnOnce(&mut PropertiesContainer) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Read one property by value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.with(|props| props.get(key).cloned())
    }

    /// Set one property.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.with(|props| props.set(key, value));
    }

    /// Copy of the current container contents.
    pub fn snapshot(&self) -> PropertiesContainer {
        self.with(|props| props.clone())
    }
}

/// The launch-framework-supplied context a run executes against.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    /// Identifier of the context (launch, debug session, ...).
    pub context_id: String,
    /// Read-mostly context attributes.
    pub properties: PropertiesContainer,
}

impl StepContext {
    /// Context with the given id and no attributes.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self { context_id: context_id.into(), properties: PropertiesContainer::new() }
    }
}

/// Completion callback of one step execution. Consuming it is the only way
/// to report completion, so a step cannot complete twice.
pub type StepDone = Box<dyn FnOnce(anyhow::Result<()>) + Send>;

/// One named, possibly asynchronous step.
pub trait Step: Send + Sync {
    /// Step name, unique within its group.
    fn id(&self) -> &str;

    /// Execute the step. `done` may be called synchronously or from any
    /// thread later; the engine will not advance until it fires.
    fn execute(
        &self,
        ctx: &StepContext,
        data: &SharedProperties,
        step_id: &FullQualifiedId,
        done: StepDone,
    );
}

/// A step backed by a closure; convenient for hosts and tests.
pub struct FnStep {
    id: String,
    run: Box<dyn Fn(&StepContext, &SharedProperties, &FullQualifiedId, StepDone) + Send + Sync>,
}

impl FnStep {
    /// Create a closure-backed step.
    pub fn new(
        id: impl Into<String>,
        run: impl Fn(&StepContext, &SharedProperties, &FullQualifiedId, StepDone)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { id: id.into(), run: Box::new(run) }
    }
}

impl Step for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(
        &self,
        ctx: &StepContext,
        data: &SharedProperties,
        step_id: &FullQualifiedId,
        done: StepDone,
    ) {
        (self.run)(ctx, data, step_id, done);
    }
}

/// Drives the repetitions of an iterated step group.
///
/// The engine calls `initialize` once when the group activates, reads
/// `num_iterations`, and calls `next` before the first execution of each
/// repetition. A failing `initialize` or `next` aborts the run.
pub trait StepGroupIterator: Send {
    /// Discover the collection to iterate over.
    fn initialize(
        &mut self,
        ctx: &StepContext,
        data: &SharedProperties,
        group_id: &FullQualifiedId,
    ) -> anyhow::Result<()>;

    /// Number of repetitions; valid after `initialize`.
    fn num_iterations(&self) -> usize;

    /// Prepare repetition `iteration` (0-based). Must fail if called before
    /// `initialize` or out of bounds.
    fn next(
        &mut self,
        ctx: &StepContext,
        data: &SharedProperties,
        iteration: usize,
        group_id: &FullQualifiedId,
    ) -> anyhow::Result<()>;
}

/// Iterates over a fixed list of values, publishing the current element
/// under the group's scope as `value` (and its position as `index`).
pub struct ValueListIterator {
    values: Vec<Value>,
    initialized: bool,
}

impl ValueListIterator {
    /// Iterator over `values`.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values, initialized: false }
    }
}

impl StepGroupIterator for ValueListIterator {
    fn initialize(
        &mut self,
        _ctx: &StepContext,
        _data: &SharedProperties,
        _group_id: &FullQualifiedId,
    ) -> anyhow::Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn num_iterations(&self) -> usize {
        self.values.len()
    }

    fn next(
        &mut self,
        _ctx: &StepContext,
        data: &SharedProperties,
        iteration: usize,
        group_id: &FullQualifiedId,
    ) -> anyhow::Result<()> {
        if !self.initialized {
            anyhow::bail!("iterator used before initialization");
        }
        let value = self
            .values
            .get(iteration)
            .ok_or_else(|| anyhow::anyhow!("iteration {iteration} out of bounds"))?
            .clone();
        let scope = group_id.as_key();
        data.with(|props| {
            props.set_scoped(&scope, "index", iteration as u64);
            props.set_scoped(&scope, "value", value);
        });
        Ok(())
    }
}

type IteratorFactory = Box<dyn Fn() -> Box<dyn StepGroupIterator> + Send + Sync>;

#[derive(Clone)]
enum StepUnit {
    Single(Arc<dyn Step>),
    Group(Arc<StepGroup>),
}

/// An ordered sequence of steps and nested groups, optionally repeated by
/// an iterator.
pub struct StepGroup {
    id: String,
    units: Vec<StepUnit>,
    iterator: Option<IteratorFactory>,
}

impl StepGroup {
    /// Empty group.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), units: Vec::new(), iterator: None }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.units.push(StepUnit::Single(Arc::new(step)));
        self
    }

    /// Append a nested group.
    #[must_use]
    pub fn group(mut self, group: StepGroup) -> Self {
        self.units.push(StepUnit::Group(Arc::new(group)));
        self
    }

    /// Repeat this group once per iteration of the iterator the factory
    /// produces. The factory runs on every activation, so a group nested in
    /// another iterated group starts fresh each time around.
    #[must_use]
    pub fn iterator<I, F>(mut self, factory: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: StepGroupIterator + 'static,
    {
        self.iterator = Some(Box::new(move || Box::new(factory())));
        self
    }
}

/// Run state of a stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Built, not yet executed.
    Initialized,
    /// Steps are executing.
    Running,
    /// All steps completed.
    Finished,
    /// Canceled between steps.
    Canceled,
    /// A step or iterator failed.
    Error,
}

type FinishCallback = Box<dyn FnOnce(Result<(), Error>) + Send>;

struct GroupFrame {
    group: Arc<StepGroup>,
    iterator: Option<Box<dyn StepGroupIterator>>,
    base_id: FullQualifiedId,
    next_unit: usize,
    iteration: usize,
    total: usize,
}

impl GroupFrame {
    fn current_id(&self) -> FullQualifiedId {
        if self.iterator.is_some() {
            self.base_id.iteration(self.iteration)
        } else {
            self.base_id.clone()
        }
    }
}

struct Run {
    state: RunState,
    stack: Vec<GroupFrame>,
    cancel_requested: bool,
    seq: u64,
    current_step: Option<String>,
    on_finish: Option<FinishCallback>,
    root: Option<Arc<StepGroup>>,
}

struct StepperInner {
    dispatcher: Arc<Dispatcher>,
    ctx: Arc<StepContext>,
    data: SharedProperties,
    run: Mutex<Run>,
}

enum FrameStep {
    Pop,
    Iterate { iterator: Box<dyn StepGroupIterator>, iteration: usize, base: FullQualifiedId },
    Unit(StepUnit, FullQualifiedId),
    Empty,
}

enum Action {
    Finish(RunState, Result<(), Error>),
    Iterate { iterator: Box<dyn StepGroupIterator>, iteration: usize, base: FullQualifiedId },
    Activate { group: Arc<StepGroup>, base: FullQualifiedId },
    Run { step: Arc<dyn Step>, id: FullQualifiedId, seq: u64 },
}

impl StepperInner {
    fn lock(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(self: &Arc<Self>) {
        let root = self.lock().root.take();
        let Some(root) = root else { return };
        let base = FullQualifiedId::new(root.id.clone());
        match self.activate_group(root, base) {
            Ok(_) => self.advance(),
            Err((id, e)) => self.finish(RunState::Error, Err(Error::step_failed(id, e))),
        }
    }

    /// Push a frame for `group`, running its iterator's first repetition
    /// setup. Returns `Ok(false)` when the iterator reports zero iterations
    /// and the group is skipped entirely.
    fn activate_group(
        self: &Arc<Self>,
        group: Arc<StepGroup>,
        base_id: FullQualifiedId,
    ) -> Result<bool, (String, anyhow::Error)> {
        let mut iterator = group.iterator.as_ref().map(|factory| factory());
        let mut total = 1;
        if let Some(it) = iterator.as_mut() {
            it.initialize(&self.ctx, &self.data, &base_id)
                .map_err(|e| (base_id.to_string(), e))?;
            total = it.num_iterations();
            if total == 0 {
                log::debug!("skipping group '{base_id}': zero iterations");
                return Ok(false);
            }
            it.next(&self.ctx, &self.data, 0, &base_id)
                .map_err(|e| (base_id.iteration(0).to_string(), e))?;
        }
        self.lock().stack.push(GroupFrame {
            group,
            iterator,
            base_id,
            next_unit: 0,
            iteration: 0,
            total,
        });
        Ok(true)
    }

    fn next_frame_step(run: &mut Run) -> FrameStep {
        let Some(frame) = run.stack.last_mut() else { return FrameStep::Empty };
        if frame.next_unit >= frame.group.units.len() {
            if frame.iteration + 1 < frame.total {
                if let Some(iterator) = frame.iterator.take() {
                    frame.iteration += 1;
                    frame.next_unit = 0;
                    return FrameStep::Iterate {
                        iterator,
                        iteration: frame.iteration,
                        base: frame.base_id.clone(),
                    };
                }
            }
            return FrameStep::Pop;
        }
        let unit = frame.group.units[frame.next_unit].clone();
        frame.next_unit += 1;
        FrameStep::Unit(unit, frame.current_id())
    }

    fn next_action(&self, run: &mut Run) -> Action {
        if run.cancel_requested {
            return Action::Finish(RunState::Canceled, Err(Error::Canceled));
        }
        loop {
            match Self::next_frame_step(run) {
                FrameStep::Empty => return Action::Finish(RunState::Finished, Ok(())),
                FrameStep::Pop => {
                    run.stack.pop();
                }
                FrameStep::Iterate { iterator, iteration, base } => {
                    return Action::Iterate { iterator, iteration, base };
                }
                FrameStep::Unit(StepUnit::Single(step), current) => {
                    run.seq += 1;
                    let id = current.child(step.id());
                    run.current_step = Some(id.to_string());
                    return Action::Run { step, id, seq: run.seq };
                }
                FrameStep::Unit(StepUnit::Group(group), current) => {
                    let base = current.child(&group.id);
                    return Action::Activate { group, base };
                }
            }
        }
    }

    fn advance(self: &Arc<Self>) {
        loop {
            let action = {
                let mut run = self.lock();
                if run.state != RunState::Running {
                    return;
                }
                self.next_action(&mut run)
            };
            match action {
                Action::Finish(state, result) => {
                    self.finish(state, result);
                    return;
                }
                Action::Iterate { mut iterator, iteration, base } => {
                    // User code runs without the engine lock held.
                    let result = iterator.next(&self.ctx, &self.data, iteration, &base);
                    {
                        let mut run = self.lock();
                        if run.state != RunState::Running {
                            return;
                        }
                        if let Some(frame) = run.stack.last_mut() {
                            frame.iterator = Some(iterator);
                        }
                    }
                    if let Err(e) = result {
                        let id = base.iteration(iteration).to_string();
                        self.finish(RunState::Error, Err(Error::step_failed(id, e)));
                        return;
                    }
                }
                Action::Activate { group, base } => {
                    if let Err((id, e)) = self.activate_group(group, base) {
                        self.finish(RunState::Error, Err(Error::step_failed(id, e)));
                        return;
                    }
                }
                Action::Run { step, id, seq } => {
                    let inner = self.clone();
                    let dispatcher = self.dispatcher.clone();
                    let done: StepDone = Box::new(move |result| {
                        let submitted =
                            dispatcher.invoke_later(move || inner.step_done(seq, result));
                        if submitted.is_err() {
                            log::debug!("step completion dropped after dispatcher shutdown");
                        }
                    });
                    log::debug!("executing step '{id}'");
                    step.execute(&self.ctx, &self.data, &id, done);
                    // Resumes from step_done once the callback fires.
                    return;
                }
            }
        }
    }

    fn step_done(self: &Arc<Self>, seq: u64, result: anyhow::Result<()>) {
        {
            let mut run = self.lock();
            if run.state != RunState::Running || run.seq != seq {
                log::debug!("discarding completion of superseded step");
                return;
            }
            if run.cancel_requested {
                // The step was allowed to finish, but its result is
                // discarded on a canceled run.
                drop(run);
                self.finish(RunState::Canceled, Err(Error::Canceled));
                return;
            }
            if let Err(e) = result {
                let id = run.current_step.take().unwrap_or_default();
                drop(run);
                self.finish(RunState::Error, Err(Error::step_failed(id, e)));
                return;
            }
            run.current_step = None;
        }
        self.advance();
    }

    fn finish(self: &Arc<Self>, state: RunState, result: Result<(), Error>) {
        let on_finish;
        {
            let mut run = self.lock();
            if run.state != RunState::Running {
                return;
            }
            run.state = state;
            run.stack.clear();
            on_finish = run.on_finish.take();
        }
        match &result {
            Ok(()) => log::debug!("stepper run finished"),
            Err(e) => log::debug!("stepper run ended: {e}"),
        }
        if let Some(on_finish) = on_finish {
            on_finish(result);
        }
    }
}

/// Sequential state machine executing a step group against a context.
///
/// Cheaply cloneable; clones share the same run.
#[derive(Clone)]
pub struct Stepper {
    inner: Arc<StepperInner>,
}

impl Stepper {
    /// Build a stepper for one run of `root`.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        root: StepGroup,
        ctx: StepContext,
        data: PropertiesContainer,
    ) -> Self {
        Self {
            inner: Arc::new(StepperInner {
                dispatcher,
                ctx: Arc::new(ctx),
                data: SharedProperties::new(data),
                run: Mutex::new(Run {
                    state: RunState::Initialized,
                    stack: Vec::new(),
                    cancel_requested: false,
                    seq: 0,
                    current_step: None,
                    on_finish: None,
                    root: Some(Arc::new(root)),
                }),
            }),
        }
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    /// The shared properties container of this run.
    pub fn data(&self) -> SharedProperties {
        self.inner.data.clone()
    }

    /// Start the run. `on_finish` fires exactly once on the dispatch thread
    /// with the run's final result. A stepper executes at most once.
    pub fn execute(
        &self,
        on_finish: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) -> Result<(), Error> {
        {
            let mut run = self.inner.lock();
            if run.state != RunState::Initialized {
                return Err(Error::AlreadyStarted);
            }
            run.state = RunState::Running;
            run.on_finish = Some(Box::new(on_finish));
        }
        let inner = self.inner.clone();
        let submitted = self.inner.dispatcher.invoke_later(move || inner.start());
        if submitted.is_err() {
            let mut run = self.inner.lock();
            run.state = RunState::Error;
            run.on_finish = None;
            return Err(Error::DispatcherShutDown);
        }
        Ok(())
    }

    /// Request cancellation. The flag is checked between steps; a step
    /// already in flight finishes, but its result is discarded.
    pub fn cancel(&self) {
        self.inner.lock().cancel_requested = true;
    }
}
