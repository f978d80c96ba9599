//! Error and result classification shared by the engines.
//!
//! An [`ErrorMatcher`] decides whether an error belongs to some family. Matching walks the
//! `source()` chain, so a matcher for `io::Error` also matches an application error that
//! wraps one. An [`ErrorClassifier`] combines two matcher lists:
//!
//! - `ignore_on`: matching errors are passed through untouched and never counted.
//! - `match_on`: matching errors are acted on (retried, recorded as failures). An empty list
//!   matches every error.
//!
//! `ignore_on` wins when an error matches both lists.
//!
//! Success values are classified with [`ResultMatcher`], and the rate limiter's drain rule
//! sees either side through [`CallOutcome`].

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

type MatchFn = dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync;
type ValueFn = dyn Fn(&dyn Any) -> bool + Send + Sync;
type OutcomeFn = dyn Fn(&CallOutcome<'_>) -> bool + Send + Sync;

fn chain<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn Error + 'static)| (*e).source())
}

/// Predicate over errors. Compares by identity.
#[derive(Clone)]
pub struct ErrorMatcher {
    label: &'static str,
    matcher: Arc<MatchFn>,
}

impl ErrorMatcher {
    /// Matches errors of type `T`, directly or anywhere in the source chain.
    pub fn of<T: Error + 'static>() -> Self {
        Self {
            label: std::any::type_name::<T>(),
            matcher: Arc::new(|err| chain(err).any(|e| e.is::<T>())),
        }
    }

    /// Matches errors of type `T` (directly or in the source chain) accepted by `predicate`.
    pub fn when<T, F>(predicate: F) -> Self
    where
        T: Error + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            label: std::any::type_name::<T>(),
            matcher: Arc::new(move |err| {
                chain(err).filter_map(|e| e.downcast_ref::<T>()).any(|e| predicate(e))
            }),
        }
    }

    /// Matches with an arbitrary predicate over the outermost error.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self { label: "predicate", matcher: Arc::new(predicate) }
    }

    pub fn matches(&self, err: &(dyn Error + 'static)) -> bool {
        (self.matcher)(err)
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorMatcher({})", self.label)
    }
}

impl PartialEq for ErrorMatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.matcher, &other.matcher)
    }
}

/// What an engine should do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Act on the error: retry it, or record it as a failure.
    Retry,
    /// Pass the error through without counting it.
    Ignore,
    /// Neither ignored nor matched: pass it through as a final failure.
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorClassifier {
    match_on: Vec<ErrorMatcher>,
    ignore_on: Vec<ErrorMatcher>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_match(mut self, matcher: ErrorMatcher) -> Self {
        self.match_on.push(matcher);
        self
    }

    pub fn with_ignore(mut self, matcher: ErrorMatcher) -> Self {
        self.ignore_on.push(matcher);
        self
    }

    pub fn is_ignored(&self, err: &(dyn Error + 'static)) -> bool {
        self.ignore_on.iter().any(|m| m.matches(err))
    }

    /// True when `match_on` is empty or any entry matches.
    pub fn is_matched(&self, err: &(dyn Error + 'static)) -> bool {
        self.match_on.is_empty() || self.match_on.iter().any(|m| m.matches(err))
    }

    pub fn classify(&self, err: &(dyn Error + 'static)) -> Classification {
        if self.is_ignored(err) {
            Classification::Ignore
        } else if self.is_matched(err) {
            Classification::Retry
        } else {
            Classification::Fail
        }
    }

    pub fn match_on(&self) -> &[ErrorMatcher] {
        &self.match_on
    }

    pub fn ignore_on(&self) -> &[ErrorMatcher] {
        &self.ignore_on
    }
}

/// Predicate over successful values. Values of other types never match.
#[derive(Clone)]
pub struct ResultMatcher {
    label: &'static str,
    matcher: Arc<ValueFn>,
}

impl ResultMatcher {
    pub fn when<T, F>(predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            label: std::any::type_name::<T>(),
            matcher: Arc::new(move |value| value.downcast_ref::<T>().is_some_and(&predicate)),
        }
    }

    pub fn matches(&self, value: &dyn Any) -> bool {
        (self.matcher)(value)
    }
}

impl fmt::Debug for ResultMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultMatcher({})", self.label)
    }
}

impl PartialEq for ResultMatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.matcher, &other.matcher)
    }
}

/// Finished call as seen by outcome predicates.
#[derive(Clone, Copy)]
pub enum CallOutcome<'a> {
    Value(&'a dyn Any),
    Error(&'a (dyn Error + 'static)),
}

impl<'a> CallOutcome<'a> {
    /// The success value, if the call succeeded with a `T`.
    pub fn value<T: 'static>(&self) -> Option<&'a T> {
        match *self {
            CallOutcome::Value(v) => v.downcast_ref::<T>(),
            CallOutcome::Error(_) => None,
        }
    }

    /// The first error of type `T` in the error's source chain.
    pub fn error<T: Error + 'static>(&self) -> Option<&'a T> {
        match *self {
            CallOutcome::Error(e) => chain(e).find_map(|e| e.downcast_ref::<T>()),
            CallOutcome::Value(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CallOutcome::Error(_))
    }
}

impl fmt::Debug for CallOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Value(_) => write!(f, "CallOutcome::Value(..)"),
            CallOutcome::Error(e) => write!(f, "CallOutcome::Error({})", e),
        }
    }
}

/// Predicate over a finished call. Compares by identity.
#[derive(Clone)]
pub struct OutcomeMatcher {
    matcher: Arc<OutcomeFn>,
}

impl OutcomeMatcher {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&CallOutcome<'_>) -> bool + Send + Sync + 'static,
    {
        Self { matcher: Arc::new(predicate) }
    }

    /// Matches success values of type `T` accepted by `predicate`.
    pub fn on_value<T, F>(predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::new(move |outcome| outcome.value::<T>().is_some_and(&predicate))
    }

    /// Matches errors accepted by `matcher`.
    pub fn on_error(matcher: ErrorMatcher) -> Self {
        Self::new(move |outcome| match outcome {
            CallOutcome::Error(e) => matcher.matches(*e),
            CallOutcome::Value(_) => false,
        })
    }

    pub fn matches(&self, outcome: &CallOutcome<'_>) -> bool {
        (self.matcher)(outcome)
    }
}

impl fmt::Debug for OutcomeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutcomeMatcher(..)")
    }
}

impl PartialEq for OutcomeMatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.matcher, &other.matcher)
    }
}
