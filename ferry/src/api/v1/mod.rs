pub mod export_relations;
