//! Prompt construction for table questions.

use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::unwrap_used)] // literal patterns
static PIPE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\|+").unwrap());

#[allow(clippy::unwrap_used)]
static GROUPED_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:,\d{3})+\b").unwrap());

/// Normalise pasted table text into a pipe-separated grid.
///
/// Tabs become column separators and runs of separators collapse into one.
/// On pipe-delimited rows, thousands separators are removed so numbers parse
/// as plain digits. Rows without a pipe are left as they are, since their
/// commas may be CSV field separators.
pub fn clean_table(raw: &str) -> String {
    let piped = raw.replace('\t', "|");
    let collapsed = PIPE_RUNS.replace_all(&piped, "|");
    collapsed
        .lines()
        .map(|row| {
            if row.contains('|') {
                GROUPED_NUMBER.replace_all(row, |caps: &regex::Captures<'_>| {
                    caps[0].replace(',', "")
                })
            } else {
                row.into()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Build the generation prompt for a table and a question about it.
pub fn build_prompt(table: &str, question: &str) -> String {
    let table = clean_table(table);
    format!(
        r"Process the table data strictly according to these steps:
1. Extract exactly the columns relevant to the question
2. Perform the arithmetic (add/subtract/multiply/divide/...)
3. Produce a standard Markdown table

Input:
Table data:
{table}

Question: {question}

**Reference example:**
[Example table]
| Product | Unit price | Units sold |
|---------|------------|------------|
| Phone   | 3000       | 120        |
| Tablet  | 2000       | 80         |

[Example question] Compute total revenue
[Correct response]
| Total revenue |
|---------------|
| 520000        |

**Unanswerable example:**
[Question] Compute average stock level

[Correct response]
| Average stock level |
|---------------------|
| null                |

**Rules:**
1. Do not explain the calculation
2. Do not rename the original headers
3. Keep the original numeric precision
4. The table must have complete borders

**Output requirements:**
- Always produce a complete Markdown table
- Use the question wording as the header
- Strip unit symbols from numeric results
- Show null when a value cannot be computed

Respond strictly in the format above."
    )
}
