// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use crate::error::{QueueError, Result};

/// Caller callback of an asynchronous queue operation.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Runs its callback exactly once.
///
/// Dropping an uncompleted `Completion` reports [`QueueError::Shutdown`], so
/// an operation whose task never ran (its sequence stopped first) still
/// answers the caller.
pub(crate) struct Completion<T> {
    callback: Option<Callback<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(callback: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub(crate) fn complete(mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(QueueError::Shutdown));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}
