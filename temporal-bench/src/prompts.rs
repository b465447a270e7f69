//! Temporal prompt sets
//!
//! Every prompt is derived from a reference date so the bench can be replayed
//! for any "today". Academic years start in August: on 2025-08-16 the current
//! year is 2025-2026 and "last year" means 2024-2025 (Fall 2024 + Spring 2025).

use std::fmt;

use chrono::{Datelike, NaiveDate};

const ACADEMIC_YEAR_START_MONTH: u32 = 8;

/// An academic year, identified by the calendar year its fall semester falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcademicYear {
    pub start: i32,
}

impl AcademicYear {
    pub const fn end(self) -> i32 {
        self.start + 1
    }

    pub fn fall(self) -> String {
        format!("Fall {}", self.start)
    }

    pub fn spring(self) -> String {
        format!("Spring {}", self.end())
    }

    pub const fn previous(self) -> Self {
        Self {
            start: self.start - 1,
        }
    }
}

impl fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalContext {
    today: NaiveDate,
}

impl TemporalContext {
    pub const fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    /// "August 16, 2025"
    pub fn today_long(&self) -> String {
        self.today.format("%B %-d, %Y").to_string()
    }

    /// "August 2025"
    pub fn month_year(&self) -> String {
        self.today.format("%B %Y").to_string()
    }

    pub fn date_line(&self) -> String {
        format!("Current date context: Today is {}.", self.today_long())
    }

    pub fn current_academic_year(&self) -> AcademicYear {
        let year = self.today.year();
        if self.today.month() >= ACADEMIC_YEAR_START_MONTH {
            AcademicYear { start: year }
        } else {
            AcademicYear { start: year - 1 }
        }
    }

    pub fn last_academic_year(&self) -> AcademicYear {
        self.current_academic_year().previous()
    }

    /// Two prompts per GPU group; drivers cycle through the groups when
    /// there are more GPUs than groups.
    pub fn multi_gpu_groups(&self) -> Vec<Vec<String>> {
        let date = self.date_line();
        let current = self.current_academic_year();
        let last = self.last_academic_year();

        vec![
            vec![
                format!("{date} Question: What year is it currently?"),
                format!("{date} Question: What month and year is it currently?"),
            ],
            vec![
                format!("{date} {} Question: If I ask about courses from 'last year', which academic year should that refer to?", semester_endings(last)),
                format!(
                    "{date} Question: If I'm starting {} semester soon, what was the previous academic year?",
                    current.fall()
                ),
            ],
            vec![
                format!("{date} I'm a student. Question: If I want to look at my course load from last academic year, what time period should I examine?"),
                format!(
                    "{date} Question: Calculate how many months ago the {} semester ended if it ended in May {}.",
                    last.spring(),
                    last.end()
                ),
            ],
        ]
    }

    pub fn optimized(&self) -> Vec<String> {
        let date = self.date_line();
        let current = self.current_academic_year();
        let last = self.last_academic_year();

        vec![
            format!(
                "{date}\nAcademic year context: Current academic year is {current}. Previous academic year was {last}.\n\
                 Student has completed 5 courses in {last}: CS 101, CS 102, MATH 201, MATH 202, HIST 101.\n\
                 Question: How many courses did I have last year?"
            ),
            format!(
                "{date}\nCanvas data shows: 486 total assignments, 29 outstanding, 457 submitted.\n\
                 Question: What percentage of my assignments are complete?"
            ),
            format!(
                "{date}\nI have assignments due on: Aug 20, Aug 25, Sep 1, Sep 5.\n\
                 Question: How many assignments are due in the next two weeks?"
            ),
        ]
    }

    pub fn basic() -> Vec<String> {
        vec![
            "How many courses did I have last year?".to_string(),
            "What assignments are from last year?".to_string(),
            "Show me my course load from last academic year.".to_string(),
        ]
    }

    /// Same questions as [`Self::basic`], with date, academic-year and
    /// student-data context in front.
    pub fn enhanced(&self) -> Vec<String> {
        let date = self.date_line();
        let current = self.current_academic_year();
        let last = self.last_academic_year();
        let (fall, spring) = (last.fall(), last.spring());
        let (start, end) = (last.start, last.end());

        vec![
            format!(
                "{date}\nAcademic year context: Current academic year is {current} ({} semester starting soon). \
                 Previous academic year was {last} ({fall} + {spring}).\n\
                 Student data context: Student has courses from {fall} (CS 101, MATH 201) and {spring} (CS 102, MATH 202, HIST 101).\n\
                 Question: How many courses did I have last year?",
                current.fall()
            ),
            format!(
                "{date}\nAcademic year context: Previous academic year {last} included {fall} semester (Aug-Dec {start}) \
                 and {spring} semester (Jan-May {end}).\n\
                 Student data context: {fall} assignments: CS 101 Project (due Oct 15, {start}), MATH 201 Homework (due Nov 20, {start}). \
                 {spring} assignments: CS 102 Final (due May 5, {end}).\n\
                 Question: What assignments are from last year?"
            ),
            format!(
                "{date}\nAcademic year context: The {last} academic year (last year) consisted of {fall} and {spring} semesters.\n\
                 Student data context: {last} course load was: {fall} (CS 101 - 3 credits, MATH 201 - 4 credits), \
                 {spring} (CS 102 - 3 credits, MATH 202 - 4 credits, HIST 101 - 3 credits). Total: 17 credits across the academic year.\n\
                 Question: Show me my course load from last academic year."
            ),
        ]
    }

    pub fn tensor_parallel(&self) -> Vec<String> {
        let date = self.date_line();
        let last = self.last_academic_year();

        vec![
            format!("{date} Question: What year is it currently?"),
            format!("{date} {} Question: If I ask about courses from 'last year', which academic year should that refer to?", semester_endings(last)),
            format!(
                "{date} Question: If today is in {}, and I'm asking about assignments from 'last academic year', what time period should that cover?",
                self.month_year()
            ),
        ]
    }

    /// Prompts for the single-GPU fallback when the tensor-parallel engine fails.
    pub fn fallback(&self) -> Vec<String> {
        let mut prompts = self.tensor_parallel();
        prompts.truncate(2);
        prompts
    }

    pub fn smoke(&self) -> Vec<String> {
        vec![
            "What year is it currently?".to_string(),
            format!("If today is {}, what year was 'last year'?", self.today_long()),
            format!(
                "If I'm in the {} semester, what academic year is that?",
                self.last_academic_year().fall()
            ),
        ]
    }
}

fn semester_endings(year: AcademicYear) -> String {
    format!(
        "Academic year context: {} semester ended in December {}, {} semester ended in May {}.",
        year.fall(),
        year.start,
        year.spring(),
        year.end()
    )
}

/// The text after `Question: `, or the whole prompt when there is none.
pub fn question_of(prompt: &str) -> &str {
    prompt
        .split_once("Question: ")
        .map_or(prompt, |(_, question)| question)
}
