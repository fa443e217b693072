//! Method interception: wrap and unwrap named call sites on a [`MethodTable`].
//!
//! Every callable member of a table is a chain of layers over its native
//! function. [`wrap_method`] pushes a tagged shim layer that owns the function
//! beneath it; [`unwrap_method`] pops the outermost layer only if it is such a
//! shim. Unrelated code may overwrite a member with [`MethodTable::replace`],
//! which installs an untagged layer: the chain below stays in the call path
//! (if the replacement calls through) but is no longer reachable for unwrap.
//!
//! [`Shimmer`] keeps an ordered record of the wraps it performed so that all
//! of them can be reversed at unload.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a member could not be wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotWrappableReason {
    /// The target has no member with that name.
    Missing,
    /// The member exists but is a plain field.
    NotCallable,
}

impl fmt::Display for NotWrappableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("no such member"),
            Self::NotCallable => f.write_str("member is not callable"),
        }
    }
}

/// Errors from the interception registry.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    /// The target member is absent or not callable; nothing was mutated.
    #[error("cannot wrap {label}.{method}: {reason}")]
    NotWrappable {
        label: String,
        method: String,
        reason: NotWrappableReason,
    },
}

// ---------------------------------------------------------------------------
// Layers and members
// ---------------------------------------------------------------------------

enum Layer<F: ?Sized> {
    /// The function the table was built with.
    Native(Arc<F>),
    /// Installed by `wrap_method`; owns the layer it replaced.
    Shim {
        label: String,
        function: Arc<F>,
        beneath: Arc<Layer<F>>,
    },
    /// Installed by `MethodTable::replace`; carries no back-reference.
    Patched(Arc<F>),
}

impl<F: ?Sized> Layer<F> {
    fn function(&self) -> &Arc<F> {
        match self {
            Self::Native(function) | Self::Patched(function) | Self::Shim { function, .. } => {
                function
            }
        }
    }
}

enum Member<F: ?Sized> {
    Method(Arc<Layer<F>>),
    Field(Value),
}

// ---------------------------------------------------------------------------
// MethodTable
// ---------------------------------------------------------------------------

/// A target whose named members can be intercepted.
///
/// `F` is the unsized function type shared by every method of the table,
/// typically `dyn Fn(..) -> .. + Send + Sync`. Fields exist so that lookups of
/// non-callable members fail the same way they would on a dynamic object.
pub struct MethodTable<F: ?Sized> {
    members: RwLock<HashMap<String, Member<F>>>,
}

impl<F: ?Sized> MethodTable<F> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Builder: adds a native method.
    #[must_use]
    pub fn with_method(self, name: &str, function: Arc<F>) -> Self {
        self.define_method(name, function);
        self
    }

    /// Builder: adds a plain field.
    #[must_use]
    pub fn with_field(self, name: &str, value: impl Into<Value>) -> Self {
        self.members
            .write()
            .insert(name.to_string(), Member::Field(value.into()));
        self
    }

    /// Defines (or redefines) a native method, discarding any layers on it.
    pub fn define_method(&self, name: &str, function: Arc<F>) {
        self.members.write().insert(
            name.to_string(),
            Member::Method(Arc::new(Layer::Native(function))),
        );
    }

    /// Returns the currently installed function for `name`, outermost layer
    /// first. Call sites dispatch through this on every invocation.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<Arc<F>> {
        match self.members.read().get(name) {
            Some(Member::Method(layer)) => Some(Arc::clone(layer.function())),
            _ => None,
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match self.members.read().get(name) {
            Some(Member::Field(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether the outermost layer of `name` is an interception layer.
    #[must_use]
    pub fn is_wrapped(&self, name: &str) -> bool {
        matches!(
            self.members.read().get(name),
            Some(Member::Method(layer)) if matches!(**layer, Layer::Shim { .. })
        )
    }

    /// The function unwrapping `name` would restore, if it is wrapped.
    #[must_use]
    pub fn original(&self, name: &str) -> Option<Arc<F>> {
        match self.members.read().get(name) {
            Some(Member::Method(layer)) => match &**layer {
                Layer::Shim { beneath, .. } => Some(Arc::clone(beneath.function())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Labels of the consecutive interception layers on `name`, outermost
    /// first. Stops at the first native or externally patched layer.
    #[must_use]
    pub fn wrap_labels(&self, name: &str) -> Vec<String> {
        let mut labels = Vec::new();
        let mut layer = match self.members.read().get(name) {
            Some(Member::Method(layer)) => Arc::clone(layer),
            _ => return labels,
        };
        while let Layer::Shim { label, beneath, .. } = &*layer {
            labels.push(label.clone());
            let next = Arc::clone(beneath);
            layer = next;
        }
        labels
    }

    /// Overwrites `name` the way code unaware of this registry would.
    ///
    /// The new function is installed untagged. If it calls through to a
    /// function it read earlier with [`method`](Self::method), any layers under
    /// that function keep running.
    pub fn replace(&self, name: &str, function: Arc<F>) {
        self.members.write().insert(
            name.to_string(),
            Member::Method(Arc::new(Layer::Patched(function))),
        );
    }
}

impl<F: ?Sized> Default for MethodTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for MethodTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members.read();
        let mut names: Vec<&String> = members.keys().collect();
        names.sort();
        f.debug_struct("MethodTable")
            .field("members", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// wrap / unwrap
// ---------------------------------------------------------------------------

/// Replaces `target[method]` with `factory(original)`.
///
/// `original` is whatever is installed now, possibly already wrapped; the new
/// layer composes on top of it. `label` tags the layer: it shows up in
/// diagnostics and is the identity [`unwrap_method`] matches on.
/// The factory must not wrap or replace members of the same table.
///
/// # Errors
///
/// Returns [`ShimError::NotWrappable`] if `method` is absent or names a field.
/// The table is left untouched in that case.
pub fn wrap_method<F, W>(
    target: &MethodTable<F>,
    label: &str,
    method: &str,
    factory: W,
) -> Result<(), ShimError>
where
    F: ?Sized,
    W: FnOnce(Arc<F>) -> Arc<F>,
{
    install(target, label, method, factory).map(|_| ())
}

/// Installs a shim layer and returns it, so callers can later recognise
/// exactly that layer.
fn install<F, W>(
    target: &MethodTable<F>,
    label: &str,
    method: &str,
    factory: W,
) -> Result<Arc<Layer<F>>, ShimError>
where
    F: ?Sized,
    W: FnOnce(Arc<F>) -> Arc<F>,
{
    let members = target.members.upgradable_read();
    let beneath = match members.get(method) {
        Some(Member::Method(layer)) => Arc::clone(layer),
        found => {
            let reason = if found.is_some() {
                NotWrappableReason::NotCallable
            } else {
                NotWrappableReason::Missing
            };
            return Err(ShimError::NotWrappable {
                label: label.to_string(),
                method: method.to_string(),
                reason,
            });
        }
    };

    let function = factory(Arc::clone(beneath.function()));
    let layer = Arc::new(Layer::Shim {
        label: label.to_string(),
        function,
        beneath,
    });

    let mut members = RwLockUpgradableReadGuard::upgrade(members);
    members.insert(method.to_string(), Member::Method(Arc::clone(&layer)));
    tracing::debug!(label, method, "wrapped method");
    Ok(layer)
}

/// Pops the outermost layer of `target[method]` if it is a shim layer tagged
/// `label`. Returns whether anything was restored.
///
/// A member that is absent, a field, never wrapped, already unwrapped,
/// overwritten by unrelated code, or topped by another owner's shim is left
/// alone; this never fails.
pub fn unwrap_method<F: ?Sized>(target: &MethodTable<F>, label: &str, method: &str) -> bool {
    pop_outermost(target, label, method, |outermost| {
        matches!(&**outermost, Layer::Shim { label: owner, .. } if owner == label)
    })
}

fn pop_outermost<F: ?Sized>(
    target: &MethodTable<F>,
    label: &str,
    method: &str,
    owned: impl FnOnce(&Arc<Layer<F>>) -> bool,
) -> bool {
    let mut members = target.members.write();
    let Some(Member::Method(layer)) = members.get(method) else {
        tracing::debug!(label, method, "no such method, nothing to unwrap");
        return false;
    };
    let Layer::Shim { beneath, .. } = &**layer else {
        tracing::debug!(label, method, "method is not wrapped, nothing to unwrap");
        return false;
    };
    if !owned(layer) {
        tracing::debug!(label, method, "outermost layer belongs to another owner, left in place");
        return false;
    }
    let beneath = Arc::clone(beneath);
    members.insert(method.to_string(), Member::Method(beneath));
    tracing::debug!(label, method, "unwrapped method");
    true
}

// ---------------------------------------------------------------------------
// InterceptionRecord
// ---------------------------------------------------------------------------

/// Record of one wrap performed through a [`Shimmer`].
///
/// Holds non-owning references to the target and to the layer the wrap
/// installed: a record never keeps either alive, restoring a dropped table is
/// skipped, and only that exact layer is ever popped.
struct InterceptionRecord<F: ?Sized> {
    target: Weak<MethodTable<F>>,
    layer: Weak<Layer<F>>,
    label: String,
    method: String,
}

/// Type-erased view of a record so one registry can hold records for tables
/// of different function types.
trait Restore: Send + Sync {
    fn restore(&self) -> bool;
    fn is_live(&self) -> bool;
    fn targets(&self, table: *const (), label: &str, method: &str) -> bool;
    fn describe(&self) -> (&str, &str);
}

impl<F> Restore for InterceptionRecord<F>
where
    F: ?Sized + Send + Sync + 'static,
{
    fn restore(&self) -> bool {
        let Some(table) = self.target.upgrade() else {
            return false;
        };
        pop_outermost(&table, &self.label, &self.method, |outermost| {
            std::ptr::eq(Arc::as_ptr(outermost), self.layer.as_ptr())
        })
    }

    fn is_live(&self) -> bool {
        self.target.strong_count() > 0
    }

    fn targets(&self, table: *const (), label: &str, method: &str) -> bool {
        self.target.as_ptr().cast::<()>() == table && self.label == label && self.method == method
    }

    fn describe(&self) -> (&str, &str) {
        (&self.label, &self.method)
    }
}

// ---------------------------------------------------------------------------
// Shimmer
// ---------------------------------------------------------------------------

/// Registry of the wraps an instrumentation layer has applied.
///
/// Records are kept in application order. [`unwrap_all`](Self::unwrap_all)
/// reverses them newest first, which restores every target to its state
/// before instrumentation as long as nobody else wrapped or re-patched it.
/// Each record only ever pops the exact layer it installed, so two shimmers
/// sharing a table never remove each other's layers.
#[derive(Default)]
pub struct Shimmer {
    records: Mutex<Vec<Box<dyn Restore>>>,
}

impl Shimmer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps `target[method]` (see [`wrap_method`]) and records the wrap.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::NotWrappable`] if the member is absent or not
    /// callable. Nothing is recorded in that case.
    pub fn wrap<F, W>(
        &self,
        target: &Arc<MethodTable<F>>,
        label: &str,
        method: &str,
        factory: W,
    ) -> Result<(), ShimError>
    where
        F: ?Sized + Send + Sync + 'static,
        W: FnOnce(Arc<F>) -> Arc<F>,
    {
        let layer = install(target, label, method, factory)?;
        self.records.lock().push(Box::new(InterceptionRecord {
            target: Arc::downgrade(target),
            layer: Arc::downgrade(&layer),
            label: label.to_string(),
            method: method.to_string(),
        }));
        Ok(())
    }

    /// Pops the layer this shimmer most recently installed on
    /// `target[method]` under `label`, and forgets that record.
    ///
    /// Returns whether the layer was restored. A layer that another owner
    /// has since wrapped over stays in place and stays recorded, so a later
    /// call can pop it once it is outermost again.
    pub fn unwrap<F>(&self, target: &Arc<MethodTable<F>>, label: &str, method: &str) -> bool
    where
        F: ?Sized + Send + Sync + 'static,
    {
        let table = Arc::as_ptr(target).cast::<()>();
        let mut records = self.records.lock();
        let Some(index) = records.iter().rposition(|r| r.targets(table, label, method)) else {
            return false;
        };
        if !records[index].restore() {
            return false;
        }
        records.remove(index);
        true
    }

    /// Reverses every recorded wrap, newest first, and clears the registry.
    ///
    /// Returns how many layers were actually restored. Records whose target
    /// was dropped, re-patched by unrelated code, or wrapped over by another
    /// owner are skipped.
    pub fn unwrap_all(&self) -> usize {
        let records = std::mem::take(&mut *self.records.lock());
        let mut restored = 0;
        for record in records.iter().rev() {
            if record.restore() {
                restored += 1;
            } else {
                let (label, method) = record.describe();
                tracing::debug!(label, method, "skipped restore, target gone or layer no longer outermost");
            }
        }
        restored
    }

    /// Number of recorded wraps whose target is still alive.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.records.lock().iter().filter(|r| r.is_live()).count()
    }

    /// `(label, method)` of every recorded wrap, oldest first.
    #[must_use]
    pub fn recorded(&self) -> Vec<(String, String)> {
        self.records
            .lock()
            .iter()
            .map(|r| {
                let (label, method) = r.describe();
                (label.to_string(), method.to_string())
            })
            .collect()
    }
}

impl fmt::Debug for Shimmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shimmer")
            .field("records", &self.records.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
