//! Weighted random action selection.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, warn};

use super::{ActionOutcome, DispatchError, ForcedSequence, WeightOverrides};

/// Declarative description of one candidate action.
#[derive(Debug, Clone)]
pub struct ActionDef<K, C> {
    pub name: &'static str,
    pub weight: f64,
    pub condition: Option<C>,
    pub key: K,
}

impl<K, C> ActionDef<K, C> {
    pub fn new(name: &'static str, weight: f64, key: K) -> Self {
        Self {
            name,
            weight,
            condition: None,
            key,
        }
    }

    pub fn when(mut self, condition: C) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone)]
struct Action<K, C> {
    weight: f64,
    /// Upper bound of this action's slice of [0, 1)
    trigger: f64,
    condition: Option<C>,
    key: K,
}

/// Executes the actions a dispatcher selects.
///
/// Action bodies live with the runner; the dispatcher only hands it the key
/// of the chosen action.
#[async_trait]
pub trait ActionRunner<K, C>: Send
where
    K: Send + 'static,
    C: Sync,
{
    type Error: From<DispatchError> + Send;

    /// Whether an action guarded by `condition` is currently applicable.
    fn condition_holds(&self, condition: &C) -> bool;

    /// Uniform draw in [0, 1).
    fn draw(&mut self) -> f64;

    async fn run_action(&mut self, key: K) -> Result<ActionOutcome, Self::Error>;
}

/// A named, weighted set of actions.
#[derive(Debug)]
pub struct Dispatcher<K, C> {
    name: &'static str,
    actions: IndexMap<&'static str, Action<K, C>>,
    no_repeat: bool,
    last: Option<&'static str>,
    max_retries: u32,
    forced: Option<Arc<ForcedSequence>>,
}

impl<K, C> Dispatcher<K, C>
where
    K: Copy + Send + Sync + 'static,
    C: Send + Sync,
{
    pub const DEFAULT_MAX_RETRIES: u32 = 10;

    /// Build a dispatcher, applying any overrides configured for `name`.
    ///
    /// Override entries naming unknown actions are ignored.
    pub fn new(
        name: &'static str,
        defs: Vec<ActionDef<K, C>>,
        overrides: &WeightOverrides,
    ) -> Result<Self, DispatchError> {
        let mut actions = IndexMap::with_capacity(defs.len());
        for def in defs {
            let action = Action {
                weight: def.weight,
                trigger: 0.0,
                condition: def.condition,
                key: def.key,
            };
            if actions.insert(def.name, action).is_some() {
                return Err(DispatchError::DuplicateAction {
                    dispatcher: name,
                    action: def.name.to_string(),
                });
            }
        }
        let mut dispatcher = Self {
            name,
            actions,
            no_repeat: false,
            last: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            forced: None,
        };
        if let Some(weights) = overrides.get(name) {
            for (action, weight) in weights {
                match dispatcher.actions.get_mut(action.as_str()) {
                    Some(a) => a.weight = *weight,
                    None => debug!("Ignoring weight override {name}.{action}: no such action"),
                }
            }
        }
        dispatcher.recompute_triggers()?;
        Ok(dispatcher)
    }

    pub fn with_no_repeat(mut self, no_repeat: bool) -> Self {
        self.no_repeat = no_repeat;
        self
    }

    /// Whether a draw avoids repeating the previous action.
    pub fn is_no_repeat(&self) -> bool {
        self.no_repeat
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_forced(mut self, forced: Option<Arc<ForcedSequence>>) -> Self {
        self.forced = forced;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// `(name, trigger)` pairs in declaration order.
    pub fn triggers(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.actions.iter().map(|(name, a)| (*name, a.trigger))
    }

    /// Replace one action's weight and renormalize.
    pub fn set_weight(&mut self, action: &str, weight: f64) -> Result<(), DispatchError> {
        let entry = self
            .actions
            .get_mut(action)
            .ok_or_else(|| DispatchError::UnknownAction {
                dispatcher: self.name,
                action: action.to_string(),
            })?;
        entry.weight = weight;
        self.recompute_triggers()
    }

    fn recompute_triggers(&mut self) -> Result<(), DispatchError> {
        if self.actions.is_empty() {
            return Err(DispatchError::Empty(self.name));
        }
        for (action, a) in &self.actions {
            if !a.weight.is_finite() || a.weight < 0.0 {
                return Err(DispatchError::InvalidWeight {
                    dispatcher: self.name,
                    action: action.to_string(),
                    weight: a.weight,
                });
            }
        }
        let total: f64 = self.actions.values().map(|a| a.weight).sum();
        if total <= 0.0 {
            return Err(DispatchError::AllZero(self.name));
        }
        let mut cumulative = 0.0;
        for a in self.actions.values_mut() {
            cumulative += a.weight / total;
            a.trigger = cumulative;
        }
        Ok(())
    }

    /// One weighted draw among applicable, positively weighted actions.
    fn draw_one<R>(&self, runner: &mut R) -> Result<&'static str, DispatchError>
    where
        R: ActionRunner<K, C> + ?Sized,
    {
        let applicable: Vec<(&'static str, f64)> = self
            .actions
            .iter()
            .filter(|(_, a)| a.weight > 0.0)
            .filter(|(_, a)| a.condition.as_ref().is_none_or(|c| runner.condition_holds(c)))
            .map(|(name, a)| (*name, a.weight))
            .collect();
        let Some(&(fallback, _)) = applicable.last() else {
            return Err(DispatchError::NothingApplicable(self.name));
        };
        let total: f64 = applicable.iter().map(|(_, w)| w).sum();
        let chance = runner.draw();
        let mut cumulative = 0.0;
        for &(name, weight) in &applicable {
            cumulative += weight / total;
            if chance < cumulative {
                return Ok(name);
            }
        }
        Ok(fallback)
    }

    /// Draw an action, honoring the no-repeat flag.
    pub fn select<R>(&self, runner: &mut R) -> Result<&'static str, DispatchError>
    where
        R: ActionRunner<K, C> + ?Sized,
    {
        let mut retries = 0;
        loop {
            let pick = self.draw_one(runner)?;
            if !self.no_repeat || self.last != Some(pick) || retries >= self.max_retries {
                return Ok(pick);
            }
            retries += 1;
        }
    }

    /// Select and run an action.
    ///
    /// A forced sequence entry for this dispatcher takes precedence over the
    /// draw. An action reporting `NoOpContinue` is followed by another draw,
    /// up to the retry bound.
    pub async fn dispatch<R>(&mut self, runner: &mut R) -> Result<ActionOutcome, R::Error>
    where
        R: ActionRunner<K, C> + ?Sized,
    {
        if let Some(action) = self.forced.as_ref().and_then(|f| f.next_for(self.name)) {
            debug!("Dispatching forced {} action {}", self.name, action);
            return self.dispatch_named(&action, runner).await;
        }
        let mut retries = 0;
        loop {
            let name = self.select(runner)?;
            self.last = Some(name);
            let key = self.actions[name].key;
            debug!("Dispatching {} action {}", self.name, name);
            let outcome = runner.run_action(key).await?;
            if outcome != ActionOutcome::NoOpContinue || retries >= self.max_retries {
                return Ok(outcome);
            }
            retries += 1;
        }
    }

    /// Run the named action regardless of weights and conditions.
    pub async fn dispatch_named<R>(&mut self, name: &str, runner: &mut R) -> Result<ActionOutcome, R::Error>
    where
        R: ActionRunner<K, C> + ?Sized,
    {
        let Some((name, action)) = self.actions.get_key_value(name) else {
            warn!("Action {} not found for {}", name, self.name);
            return Err(DispatchError::UnknownAction {
                dispatcher: self.name,
                action: name.to_string(),
            }
            .into());
        };
        let (name, key) = (*name, action.key);
        self.last = Some(name);
        debug!("Dispatching explicit {} action {}", self.name, name);
        runner.run_action(key).await
    }
}
