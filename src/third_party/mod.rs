pub mod link_resolver;
