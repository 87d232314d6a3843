//! Lifecycle behaviour scenarios driven against an in-memory guest.

mod bdd_steps;
mod scenarios;
mod test_helpers;
