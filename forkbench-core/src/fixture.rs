//! Fixture Registry
//!
//! Fixtures are typed state a benchmark borrows. Each scope instance (a
//! fork, a worker thread, or a single invocation) owns one [`FixtureSet`];
//! the set initializes a fixture on first resolution and tears everything
//! down, newest first, when it is retired or dropped.

use crate::params::Params;
use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

/// Lifetime of a fixture instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Fresh instance around every single call
    Invocation,
    /// One instance per worker thread
    Thread,
    /// One instance per fork, shared by all worker threads
    Benchmark,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Invocation => "invocation",
            Scope::Thread => "thread",
            Scope::Benchmark => "benchmark",
        })
    }
}

/// State prepared for a benchmark outside the timed window
pub trait Fixture: Sized + Send + Sync + 'static {
    /// Scope of every instance of this fixture
    const SCOPE: Scope;

    /// Build the fixture; runs once per scope instance
    fn setup(params: &Params) -> Result<Self, FixtureError>;

    /// Release resources; runs once when the scope instance is retired
    fn teardown(&mut self) {}
}

/// Fixture setup failures
#[derive(Debug, Clone, Error)]
pub enum FixtureError {
    /// A required parameter is not set anywhere
    #[error("parameter '{0}' is not set")]
    MissingParam(String),

    /// A parameter is set but does not parse
    #[error("parameter '{name}' has invalid value '{value}': {message}")]
    InvalidParam {
        /// Parameter name
        name: String,
        /// Raw value
        value: String,
        /// Parser message
        message: String,
    },

    /// The initializer returned an error of its own
    #[error("{0}")]
    Setup(String),

    /// The initializer panicked
    #[error("setup panicked: {0}")]
    Panicked(String),

    /// A fixture was resolved into a set of another scope
    #[error("fixture {fixture} has scope {expected} but was resolved in a {actual} set")]
    ScopeMismatch {
        /// Fixture type name
        fixture: &'static str,
        /// Declared scope
        expected: Scope,
        /// Scope of the set
        actual: Scope,
    },
}

impl FixtureError {
    /// Setup error carrying any displayable cause
    pub fn setup(cause: impl fmt::Display) -> Self {
        FixtureError::Setup(cause.to_string())
    }
}

type Erased = Box<dyn Any + Send + Sync>;

/// Type-erased, const-constructible descriptor of a fixture type.
///
/// `#[forkbench::bench]` builds a `&'static [FixtureDef]` from the argument types.
#[derive(Clone, Copy)]
pub struct FixtureDef {
    name: fn() -> &'static str,
    type_id: fn() -> TypeId,
    /// Declared scope
    pub scope: Scope,
    setup: fn(&Params) -> Result<Erased, FixtureError>,
    teardown: fn(&mut (dyn Any + Send + Sync)),
}

impl FixtureDef {
    /// Descriptor of `T`
    pub const fn of<T: Fixture>() -> Self {
        Self {
            name: std::any::type_name::<T>,
            type_id: TypeId::of::<T>,
            scope: T::SCOPE,
            setup: erased_setup::<T>,
            teardown: erased_teardown::<T>,
        }
    }

    /// Full type name
    pub fn name(&self) -> &'static str {
        (self.name)()
    }

    /// Type name without the module path
    pub fn short_name(&self) -> &'static str {
        let name = self.name();
        name.rsplit("::").next().unwrap_or(name)
    }

    /// `TypeId` of the fixture type
    pub fn type_id(&self) -> TypeId {
        (self.type_id)()
    }
}

impl fmt::Debug for FixtureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDef")
            .field("name", &self.name())
            .field("scope", &self.scope)
            .finish()
    }
}

fn erased_setup<T: Fixture>(params: &Params) -> Result<Erased, FixtureError> {
    T::setup(params).map(|value| Box::new(value) as Erased)
}

fn erased_teardown<T: Fixture>(value: &mut (dyn Any + Send + Sync)) {
    if let Some(value) = value.downcast_mut::<T>() {
        value.teardown();
    }
}

struct Slot {
    def: FixtureDef,
    value: Erased,
}

/// Fixtures owned by one scope instance, in initialization order
pub struct FixtureSet {
    scope: Scope,
    slots: Vec<Slot>,
}

impl FixtureSet {
    /// Empty set for `scope`
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            slots: Vec::new(),
        }
    }

    /// Scope this set serves
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Number of live fixtures
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no fixture is live
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Return the cached instance of `def`, initializing it on first use.
    ///
    /// A panicking initializer is reported as [`FixtureError::Panicked`];
    /// fixtures initialized earlier stay owned by the set and are still torn
    /// down on retire.
    pub fn resolve(
        &mut self,
        def: &FixtureDef,
        params: &Params,
    ) -> Result<&(dyn Any + Send + Sync), FixtureError> {
        if def.scope != self.scope {
            return Err(FixtureError::ScopeMismatch {
                fixture: def.name(),
                expected: def.scope,
                actual: self.scope,
            });
        }

        let type_id = def.type_id();
        let index = match self.slots.iter().position(|s| s.def.type_id() == type_id) {
            Some(index) => index,
            None => {
                let value = match catch_unwind(AssertUnwindSafe(|| (def.setup)(params))) {
                    Ok(result) => result?,
                    Err(payload) => return Err(FixtureError::Panicked(panic_message(&*payload))),
                };
                tracing::trace!(fixture = def.short_name(), scope = %self.scope, "fixture initialized");
                self.slots.push(Slot { def: *def, value });
                self.slots.len() - 1
            }
        };
        Ok(&*self.slots[index].value)
    }

    /// Typed [`resolve`](Self::resolve)
    pub fn resolve_typed<T: Fixture>(&mut self, params: &Params) -> Result<&T, FixtureError> {
        let def = FixtureDef::of::<T>();
        let value = self.resolve(&def, params)?;
        value
            .downcast_ref::<T>()
            .ok_or(FixtureError::Setup(format!("type confusion for {}", def.name())))
    }

    /// Initialized instance of `T`, if any
    pub fn get<T: Fixture>(&self) -> Option<&T> {
        let type_id = TypeId::of::<T>();
        self.slots
            .iter()
            .find(|s| s.def.type_id() == type_id)
            .and_then(|s| s.value.downcast_ref::<T>())
    }

    /// Tear down every fixture in reverse initialization order.
    ///
    /// A panicking teardown is logged and the remaining teardowns still run.
    /// The set is empty and reusable afterwards.
    pub fn retire(&mut self) {
        while let Some(mut slot) = self.slots.pop() {
            let name = slot.def.short_name();
            let teardown = slot.def.teardown;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| teardown(&mut *slot.value))) {
                tracing::warn!(
                    fixture = name,
                    scope = %self.scope,
                    "fixture teardown panicked: {}",
                    panic_message(&*payload)
                );
            }
        }
    }
}

impl Drop for FixtureSet {
    fn drop(&mut self) {
        self.retire();
    }
}

impl fmt::Debug for FixtureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureSet")
            .field("scope", &self.scope)
            .field(
                "fixtures",
                &self.slots.iter().map(|s| s.def.short_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Failure raised by a benchmark body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    /// Error carrying any displayable cause
    pub fn new(cause: impl fmt::Display) -> Self {
        Self {
            message: cause.to_string(),
        }
    }

    /// Human-readable cause
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What a benchmark body sees during one call
pub struct Invocation<'a> {
    benchmark: &'a FixtureSet,
    thread: &'a FixtureSet,
    invocation: &'a FixtureSet,
    params: &'a Params,
    thread_index: u32,
}

impl<'a> Invocation<'a> {
    /// Bundle the three scope sets of the calling thread
    pub fn new(
        benchmark: &'a FixtureSet,
        thread: &'a FixtureSet,
        invocation: &'a FixtureSet,
        params: &'a Params,
        thread_index: u32,
    ) -> Self {
        Self {
            benchmark,
            thread,
            invocation,
            params,
            thread_index,
        }
    }

    /// Borrow a prepared fixture.
    ///
    /// The scheduler prepares every fixture a benchmark declares before the
    /// timer starts, so this is a lookup, never an initialization.
    #[inline]
    pub fn fixture<T: Fixture>(&self) -> Result<&'a T, InvocationError> {
        let set = match T::SCOPE {
            Scope::Benchmark => self.benchmark,
            Scope::Thread => self.thread,
            Scope::Invocation => self.invocation,
        };
        set.get::<T>().ok_or_else(|| {
            InvocationError::new(format!(
                "fixture {} was not prepared; declare it as a benchmark argument",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Parameters of the running combination
    pub fn params(&self) -> &'a Params {
        self.params
    }

    /// Index of the calling worker thread
    pub fn thread_index(&self) -> u32 {
        self.thread_index
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
