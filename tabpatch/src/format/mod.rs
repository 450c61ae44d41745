// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod avb;
pub mod bootimage;
pub mod hashtree;
pub mod image;
pub mod padding;
pub mod rawprogram;
