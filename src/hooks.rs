//! Authorization and trigger hooks
//!
//! Hooks are registered per collection on the database handle. Authorizers
//! run for every non-internal command and may deny it; triggers run for the
//! actions they are bound to and may patch the document being written.

use std::sync::Arc;

use dashmap::DashMap;

use crate::context::Context;
use crate::document::Document;
use crate::error::DbResult;
use crate::tx::{Action, Command};

/// Decides whether a command may run.
///
/// Returning `Ok(false)` rejects the command with `Forbidden`.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, ctx: &Context, command: &Command, before: Option<&Document>)
        -> DbResult<bool>;
}

impl<F> Authorizer for F
where
    F: Fn(&Context, &Command, Option<&Document>) -> DbResult<bool> + Send + Sync,
{
    fn authorize(
        &self,
        ctx: &Context,
        command: &Command,
        before: Option<&Document>,
    ) -> DbResult<bool> {
        self(ctx, command, before)
    }
}

/// Side effect run before a command is written.
///
/// `after` is `None` for deletes. An error aborts the command before any
/// write.
pub trait Trigger: Send + Sync {
    fn fire(
        &self,
        ctx: &Context,
        action: Action,
        before: Option<&Document>,
        after: Option<&mut Document>,
    ) -> DbResult<()>;
}

impl<F> Trigger for F
where
    F: Fn(&Context, Action, Option<&Document>, Option<&mut Document>) -> DbResult<()>
        + Send
        + Sync,
{
    fn fire(
        &self,
        ctx: &Context,
        action: Action,
        before: Option<&Document>,
        after: Option<&mut Document>,
    ) -> DbResult<()> {
        self(ctx, action, before, after)
    }
}

#[derive(Clone)]
struct BoundTrigger {
    actions: Vec<Action>,
    trigger: Arc<dyn Trigger>,
}

/// Hooks keyed by collection
#[derive(Default)]
pub struct HookRegistry {
    authorizers: DashMap<String, Vec<Arc<dyn Authorizer>>>,
    triggers: DashMap<String, Vec<BoundTrigger>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_authorizer(&self, collection: &str, authorizer: Arc<dyn Authorizer>) {
        self.authorizers
            .entry(collection.to_string())
            .or_default()
            .push(authorizer);
    }

    /// Binds `trigger` to `actions`; an empty list binds every action
    pub fn register_trigger(&self, collection: &str, actions: &[Action], trigger: Arc<dyn Trigger>) {
        self.triggers
            .entry(collection.to_string())
            .or_default()
            .push(BoundTrigger {
                actions: actions.to_vec(),
                trigger,
            });
    }

    /// True when every authorizer of the collection allows the command
    pub fn authorize(
        &self,
        ctx: &Context,
        command: &Command,
        before: Option<&Document>,
    ) -> DbResult<bool> {
        // hooks run without holding the map shard
        let Some(list) = self.authorizers.get(&command.collection).map(|l| l.clone()) else {
            return Ok(true);
        };
        for authorizer in &list {
            if !authorizer.authorize(ctx, command, before)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the triggers bound to `action` in registration order
    pub fn fire(
        &self,
        ctx: &Context,
        collection: &str,
        action: Action,
        before: Option<&Document>,
        mut after: Option<&mut Document>,
    ) -> DbResult<()> {
        let Some(list) = self.triggers.get(collection).map(|l| l.clone()) else {
            return Ok(());
        };
        for bound in &list {
            if bound.actions.is_empty() || bound.actions.contains(&action) {
                bound
                    .trigger
                    .fire(ctx, action, before, after.as_deref_mut())?;
            }
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.authorizers.clear();
        self.triggers.clear();
    }
}
