// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bridge
//!
//! A resilient RabbitMQ publishing layer for long-running hosts: one supervised
//! connection that recovers on its own, logical channels declared lazily on
//! first use, and a non-blocking fluent publisher.

mod otel;
mod tls;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod client;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod routing;
pub mod state;
pub mod supervisor;
pub mod topology;
pub mod transport;
