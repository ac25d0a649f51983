use crate::camera::CapturedImage;
use crate::providers::{ProviderError, RecipeAi};
use crate::types::RecipeDetails;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ToolCategory {
    Cookware,
    Utensil,
    Appliance,
}

#[derive(Debug, Clone, Copy)]
pub struct KitchenTool {
    pub id: &'static str,
    pub name: &'static str,
    pub category: ToolCategory,
    pub optional: bool,
}

const fn tool(id: &'static str, name: &'static str, category: ToolCategory) -> KitchenTool {
    KitchenTool {
        id,
        name,
        category,
        optional: false,
    }
}

pub const KNOWN_TOOLS: &[KitchenTool] = &[
    tool("knife", "Knife", ToolCategory::Utensil),
    tool("cutting-board", "Cutting Board", ToolCategory::Utensil),
    tool("pan", "Frying Pan", ToolCategory::Cookware),
    tool("pot", "Pot", ToolCategory::Cookware),
    tool("spatula", "Spatula", ToolCategory::Utensil),
    tool("wooden-spoon", "Wooden Spoon", ToolCategory::Utensil),
    tool("whisk", "Whisk", ToolCategory::Utensil),
    tool("mixing-bowl", "Mixing Bowl", ToolCategory::Cookware),
    tool("measuring-cups", "Measuring Cups", ToolCategory::Utensil),
    tool("measuring-spoons", "Measuring Spoons", ToolCategory::Utensil),
    tool("strainer", "Strainer", ToolCategory::Utensil),
    tool("grater", "Grater", ToolCategory::Utensil),
    tool("peeler", "Peeler", ToolCategory::Utensil),
    tool("baking-sheet", "Baking Sheet", ToolCategory::Cookware),
    tool("oven", "Oven", ToolCategory::Appliance),
    tool("stove", "Stove", ToolCategory::Appliance),
    KitchenTool {
        optional: true,
        ..tool("blender", "Blender", ToolCategory::Appliance)
    },
    KitchenTool {
        optional: true,
        ..tool("food-processor", "Food Processor", ToolCategory::Appliance)
    },
];

/// Always suggested, whatever the recipe says.
pub const ESSENTIAL_TOOLS: &[&str] = &["knife", "cutting-board", "stove"];

pub fn find_tool(id: &str) -> Option<&'static KitchenTool> {
    KNOWN_TOOLS.iter().find(|t| t.id == id)
}

/// Tools whose name words appear in the recipe text, followed by the essentials.
///
/// ```
/// use chefquest_core::prepare::suggest_tools;
/// use chefquest_core::types::{RecipeDetails, SourceStep};
///
/// let recipe = RecipeDetails {
///     id: "omelet".into(),
///     title: "Omelet".into(),
///     description: "Fluffy eggs".into(),
///     time: "10 mins".into(),
///     servings: "1".into(),
///     difficulty: "Easy".into(),
///     ingredients: vec![],
///     steps: vec![SourceStep { step_number: 1, instruction: "Whisk the eggs".into() }],
///     image_prompt: String::new(),
/// };
/// let tools = suggest_tools(&recipe);
/// assert_eq!(tools[0], "whisk");
/// assert!(tools.contains(&"stove"));
/// ```
pub fn suggest_tools(recipe: &RecipeDetails) -> Vec<&'static str> {
    let text = std::iter::once(recipe.description.as_str())
        .chain(recipe.steps.iter().map(|s| s.instruction.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut suggested: Vec<&'static str> = KNOWN_TOOLS
        .iter()
        .filter(|t| {
            t.name
                .to_lowercase()
                .split_whitespace()
                .any(|keyword| text.contains(keyword))
        })
        .map(|t| t.id)
        .collect();
    for essential in ESSENTIAL_TOOLS.iter().copied() {
        if !suggested.contains(&essential) {
            suggested.push(essential);
        }
    }
    suggested
}

/// The set of tools the cook confirms before starting.
#[derive(Debug, Clone, Default)]
pub struct ToolChecklist {
    selected: BTreeSet<&'static str>,
}

impl ToolChecklist {
    pub fn for_recipe(recipe: &RecipeDetails) -> Self {
        Self {
            selected: suggest_tools(recipe).into_iter().collect(),
        }
    }

    /// Flips selection; returns whether the tool is now selected. Unknown ids are ignored.
    pub fn toggle(&mut self, id: &str) -> bool {
        let Some(tool) = find_tool(id) else {
            return false;
        };
        if !self.selected.remove(tool.id) {
            self.selected.insert(tool.id);
            return true;
        }
        false
    }

    /// Adds identified ids that belong to the known catalog; returns how many were new.
    pub fn merge_identified<S: AsRef<str>>(&mut self, ids: &[S]) -> usize {
        ids.iter()
            .filter_map(|id| find_tool(id.as_ref()))
            .filter(|tool| self.selected.insert(tool.id))
            .count()
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.contains(id)
    }

    pub fn selected(&self) -> Vec<&'static str> {
        self.selected.iter().copied().collect()
    }
}

/// Asks the AI which tools `image` shows and merges them into `checklist`.
pub async fn identify_into<A>(
    ai: &A,
    image: &CapturedImage,
    checklist: &mut ToolChecklist,
) -> Result<usize, ProviderError>
where
    A: RecipeAi + ?Sized,
{
    let identified = ai.identify_tools(image).await?;
    tracing::debug!(count = identified.len(), "tools identified");
    Ok(checklist.merge_identified(&identified))
}
