/*
 * Copyright (c) 2022 McSib
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::warn;

/// Used when a template fails to parse.
const FALLBACK_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar} {pos}/{len}";

/// A builder that helps in making a new [ProgressStyle] for use.
pub(crate) struct ProgressStyleBuilder {
    progress_style: ProgressStyle,
}

impl ProgressStyleBuilder {
    /// Bar style for download groups.
    pub(crate) fn bar() -> Self {
        Self {
            progress_style: ProgressStyle::default_bar(),
        }
    }

    /// Spinner style for open-ended work such as tag listing.
    pub(crate) fn spinner() -> Self {
        Self {
            progress_style: ProgressStyle::default_spinner(),
        }
    }

    /// Sets the template, falling back to a plain bar if it does not parse.
    pub(crate) fn template(mut self, msg_template: &str) -> Self {
        match self.progress_style.clone().template(msg_template) {
            Ok(style) => self.progress_style = style,
            Err(err) => {
                warn!("Template error with '{}': {}. Using fallback template.", msg_template, err);
                self.progress_style = self
                    .progress_style
                    .clone()
                    .template(FALLBACK_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar());
            }
        }
        self
    }

    pub(crate) fn progress_chars(mut self, chars: &str) -> Self {
        self.progress_style = self.progress_style.progress_chars(chars);
        self
    }

    pub(crate) fn build(self) -> ProgressStyle {
        self.progress_style
    }
}

/// A builder that helps in initializing and configuring a new [ProgressBar] for use.
pub(crate) struct ProgressBarBuilder {
    progress_bar: ProgressBar,
}

impl ProgressBarBuilder {
    pub(crate) fn new(len: u64) -> Self {
        Self {
            progress_bar: ProgressBar::new(len),
        }
    }

    pub(crate) fn spinner() -> Self {
        Self {
            progress_bar: ProgressBar::new_spinner(),
        }
    }

    pub(crate) fn style(self, progress_style: ProgressStyle) -> Self {
        self.progress_bar.set_style(progress_style);
        self
    }

    pub(crate) fn message(self, message: impl Into<String>) -> Self {
        self.progress_bar.set_message(message.into());
        self
    }

    /// Attaches the bar to `multi` so several bars can draw together.
    pub(crate) fn attach(self, multi: &MultiProgress) -> Self {
        Self {
            progress_bar: multi.add(self.progress_bar),
        }
    }

    pub(crate) fn steady_tick(self, duration: Duration) -> Self {
        self.progress_bar.enable_steady_tick(duration);
        self
    }

    pub(crate) fn build(self) -> ProgressBar {
        self.progress_bar
    }
}

/// Style shared by every download group bar.
pub(crate) fn download_style() -> ProgressStyle {
    ProgressStyleBuilder::bar()
        .template("{msg:20} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({percent}%)")
        .progress_chars("=>-")
        .build()
}

/// Style for spinners whose message carries the progress.
pub(crate) fn spinner_style() -> ProgressStyle {
    ProgressStyleBuilder::spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .build()
}
