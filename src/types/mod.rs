/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the basic types the fork database stores and orders.

pub mod basic;

pub mod block;

pub mod block_state;

pub mod crypto_primitives;
