// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Weak};

use crate::{FrameInfo, Module};

/// One outgoing edge of a module.
pub(crate) struct Observer {
    dst: Weak<Module>,
    output: usize,
    frame: Option<FrameInfo>,
}

impl Observer {
    pub(crate) fn new(dst: &Arc<Module>, output: usize) -> Self {
        Self {
            dst: Arc::downgrade(dst),
            output,
            frame: None,
        }
    }

    pub(crate) fn targets(&self, module: &Module) -> bool {
        std::ptr::eq(self.dst.as_ptr(), module)
    }

    pub(crate) fn destination(&self) -> Option<Arc<Module>> {
        self.dst.upgrade()
    }

    pub(crate) fn record(&mut self, frame: &FrameInfo) {
        self.frame = Some(*frame);
    }

    pub(crate) fn last_frame(&self) -> Option<FrameInfo> {
        self.frame
    }

    pub(crate) fn output(&self) -> usize {
        self.output
    }
}
