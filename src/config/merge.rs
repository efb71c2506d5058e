//! Default values and override order.

pub mod merge_policy;
