// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

/// Queries about the device itself.
pub trait Hardware {
    /// Whether the running image is an official (signed, production) build.
    fn is_official_build(&self) -> bool;

    /// How many times the device has been powerwashed, 0 if never or unknown.
    fn get_powerwash_count(&self) -> i32;

    /// When the out-of-box experience was completed, or None if it hasn't been.
    fn is_oobe_complete(&self) -> Option<SystemTime>;
}

impl<T: Hardware> Hardware for Rc<RefCell<T>> {
    fn is_official_build(&self) -> bool {
        self.borrow().is_official_build()
    }
    fn get_powerwash_count(&self) -> i32 {
        self.borrow().get_powerwash_count()
    }
    fn is_oobe_complete(&self) -> Option<SystemTime> {
        self.borrow().is_oobe_complete()
    }
}

/// A Hardware whose answers are set directly.
#[derive(Clone, Debug)]
pub struct FakeHardware {
    pub official_build: bool,
    pub powerwash_count: i32,
    pub oobe_completed_at: Option<SystemTime>,
}

impl Default for FakeHardware {
    fn default() -> Self {
        FakeHardware { official_build: true, powerwash_count: 0, oobe_completed_at: None }
    }
}

impl Hardware for FakeHardware {
    fn is_official_build(&self) -> bool {
        self.official_build
    }
    fn get_powerwash_count(&self) -> i32 {
        self.powerwash_count
    }
    fn is_oobe_complete(&self) -> Option<SystemTime> {
        self.oobe_completed_at
    }
}

/// A/B slot bookkeeping, needed to say where an update will be written.
pub trait BootControl {
    fn num_slots(&self) -> u32;
    fn current_slot(&self) -> u32;
}

impl<T: BootControl> BootControl for Rc<RefCell<T>> {
    fn num_slots(&self) -> u32 {
        self.borrow().num_slots()
    }
    fn current_slot(&self) -> u32 {
        self.borrow().current_slot()
    }
}

#[derive(Clone, Debug)]
pub struct FakeBootControl {
    pub num_slots: u32,
    pub current_slot: u32,
}

impl Default for FakeBootControl {
    fn default() -> Self {
        FakeBootControl { num_slots: 2, current_slot: 0 }
    }
}

impl BootControl for FakeBootControl {
    fn num_slots(&self) -> u32 {
        self.num_slots
    }
    fn current_slot(&self) -> u32 {
        self.current_slot
    }
}
