// Copyright 2024 Yuanrong Scheduler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod abnormal;
pub mod bundle_manager;
pub mod bus;
pub mod domain_service;
pub mod lease_keeper;
pub mod local_service;
pub mod poller;
pub mod resource_view;
pub mod schedule_queue;

pub use abnormal::{AbnormalProcessor, Explorer, TerminateSignal};
pub use bundle_manager::{BundleManager, BundleManagerRef};
pub use bus::{mailbox, Address, Envelope};
pub use domain_service::{DomainService, Topology};
pub use lease_keeper::{LeaseKeeper, LeaseKeeperRef};
pub use local_service::{LocalService, RegistrationState};
pub use poller::ResourcePoller;
pub use resource_view::{ResourceView, ResourceViewRef};
pub use schedule_queue::{ScheduleQueue, ScheduleQueueRef};
