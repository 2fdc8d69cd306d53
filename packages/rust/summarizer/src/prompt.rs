//! Instruction template for node annotations.

use crate::SummaryRequest;

/// Fields every annotation object is asked to carry.
pub const ANNOTATION_FIELDS: [&str; 9] = [
    "content_summary",
    "key_concepts",
    "transformative_goal",
    "function_in_hierarchy",
    "inter_node_relationships",
    "implicit_concepts",
    "pedagogical_strategy",
    "intended_impact_on_reader",
    "audience_assumptions",
];

/// Build the prompt for one node.
pub fn build_prompt(request: &SummaryRequest) -> String {
    let mut prompt = String::new();

    prompt.push_str("Analyze one node of a hierarchical outline of a root text.\n\n");
    prompt.push_str(&format!(
        "CURRENT NODE\nid: {}\ntitle: {}\nspan: {}\n",
        request.node_id, request.title, request.span
    ));
    if let (Some(id), Some(title)) = (&request.parent_id, &request.parent_title) {
        prompt.push_str(&format!("parent: {id} ({title})\n"));
    }
    if let Some(excerpt) = &request.excerpt {
        prompt.push_str(&format!("\nROOT TEXT OF THIS NODE\n{excerpt}\n"));
    }

    prompt.push_str(&format!("\nFULL OUTLINE\n{}\n", request.outline_json));
    prompt.push_str(&format!("\nCOMMENTARY\n{}\n", request.commentary));

    prompt.push_str("\nRespond with one JSON object with these keys: ");
    prompt.push_str(&ANNOTATION_FIELDS.join(", "));
    prompt.push_str(
        ".\n`key_concepts` and `implicit_concepts` are arrays of strings. \
         `inter_node_relationships` is an array of objects with `related_node_id`, \
         `relationship_type` and `conceptual_bridge`. Write all text in the language \
         of the root text.\n",
    );

    prompt
}
