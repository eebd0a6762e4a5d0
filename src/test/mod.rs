pub mod test_attention;
pub mod test_graph;
pub mod test_program;
