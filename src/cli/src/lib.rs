//! Kiln CLI - build container images from inline Dockerfiles.

pub mod commands;
