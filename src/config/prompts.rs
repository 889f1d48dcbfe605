//! System prompt for the decision model.

use chrono::Local;

use super::apps::PROMPT_APPS;
use crate::grid::GridSpec;

/// Appended to the next request after a reply could not be parsed.
pub const FORMAT_CORRECTION_HINT: &str = "Your previous reply could not be used. Reply with exactly one JSON object and nothing else. \
\"action\" must be one of CLICK, TYPE, SCROLL, AWAKE, COMPLETE; CLICK needs a \"grid\" cell that exists on the grid; \
TYPE needs a non-empty \"value\"; SCROLL needs \"value\" \"up\" or \"down\"; AWAKE needs a package name in \"value\".";

const ACTIONS: &str = r#"**Available Actions:**

1. **CLICK** - Tap the center of a grid cell
   {"action": "CLICK", "grid": "E5", "explain": "Tap the search box", "summary": "On the home page, about to search."}

2. **TYPE** - Type text into the focused input field
   {"action": "TYPE", "value": "Luckin Coffee", "explain": "Search for the store", "summary": "Search box is active."}
   Add "clear_first": true to replace text already in the field.

3. **SCROLL** - Scroll the screen
   {"action": "SCROLL", "value": "down", "explain": "Look for the latte further down the menu", "summary": "On the menu page."}
   "value" must be "up" or "down". Optional "amount" is the fraction of the screen height to scroll (0-1, default 0.4).

4. **AWAKE** - Launch an app by package name
   {"action": "AWAKE", "value": "com.sankuai.meituan", "explain": "Open Meituan", "summary": "First step: open the app."}

5. **COMPLETE** - Finish the task
   {"action": "COMPLETE", "explain": "Order placed", "summary": "Ordered the coffee and chose a payment method."}
   If the task cannot be done, add "success": false and a "reason"."#;

const GUIDELINES: &str = r#"**Output Format:**
- Output ONLY one JSON object, no markdown code blocks and no extra text.
- "action" and "explain" (one sentence) are always required; "summary" is a one-sentence progress summary of the whole task.
- Write "explain" and "summary" in the language of the user's task.

**Guidelines:**
1. Study the current screenshot before deciding; use the cell labels drawn on it.
2. If a previous screenshot with an action marker is attached, use it to check whether the last action worked.
3. If you are on the wrong page, look for a back button, usually in the top-left cells.
4. If the same page keeps coming back, do not repeat the same action; try a different approach."#;

/// Build the system prompt for `grid`.
pub fn build_system_prompt(grid: &GridSpec) -> String {
    let today = Local::now().format("%B %d, %Y");
    let last_column = grid.last_column_letter();
    let packages = PROMPT_APPS
        .iter()
        .map(|(name, package)| format!("- {}: {}", name, package))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Today's date is: {today}\n\
        You are an Android GUI automation expert using a grid-based coordinate system.\n\n\
        **Grid System:**\n\
        - The screen ({width}x{height} px) is divided into a {columns}x{rows} grid\n\
        - Columns: A-{last_column} (left to right)\n\
        - Rows: 1-{rows} (top to bottom)\n\
        - Cells are named by column letter then row number, e.g. \"A1\", \"E5\", \"{last_column}{rows}\"; \
        column letters are drawn along the top and bottom edges, row numbers along the left and right edges\n\n\
        **Your Task:**\n\
        Analyze the screenshot and decide the single next action toward the user's goal.\n\n\
        {ACTIONS}\n\n\
        {GUIDELINES}\n\n\
        **Common Package Names:**\n\
        {packages}\n",
        width = grid.screen_width(),
        height = grid.screen_height(),
        columns = grid.columns(),
        rows = grid.rows(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_describes_grid() {
        let grid = GridSpec::new(10, 20, 1080, 2400).unwrap();
        let prompt = build_system_prompt(&grid);
        assert!(prompt.contains("10x20 grid"));
        assert!(prompt.contains("Columns: A-J"));
        assert!(prompt.contains("Rows: 1-20"));
        assert!(prompt.contains("\"J20\""));
        assert!(prompt.contains("com.sankuai.meituan"));
    }

    #[test]
    fn test_prompt_follows_grid_density() {
        let grid = GridSpec::new(8, 15, 720, 1600).unwrap();
        let prompt = build_system_prompt(&grid);
        assert!(prompt.contains("Columns: A-H"));
        assert!(prompt.contains("Rows: 1-15"));
    }
}
