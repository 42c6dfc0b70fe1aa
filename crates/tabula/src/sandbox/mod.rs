// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! Restricted execution environment for model-generated analysis scripts.
//!
//! Scripts are written in a deliberately small statement language (`let`
//! bindings, calls, arithmetic) that is parsed up front and evaluated by a
//! tree-walking interpreter whose only capabilities are the enumerated
//! builtins and the injected data handle. There is no import, filesystem,
//! network, or process surface to escape to.

pub mod executor;
pub mod interpreter;
pub mod parser;
