// Copyright 2023 Google LLC
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

//! The length-prefixed stdio channel to the privileged native host
//! (spec.md §4.4). One reader task demultiplexes inbound frames by
//! `type`; one writer task owns the write half so every outbound frame
//! goes through a single point, per spec.md §5's single-writer rule.

mod channel;

pub use channel::HostChannel;
