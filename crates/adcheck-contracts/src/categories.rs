use std::fmt;

/// One independently reviewed rule domain.
///
/// Declaration order is the canonical report order: dispatch may complete in
/// any order, but sections are always assembled as `[Atm, Logo, Wording,
/// Format]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Atm,
    Logo,
    Wording,
    Format,
}

/// Caption shown to the model immediately before the matching reference
/// image, plus the file name resolved against the references directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    pub caption: &'static str,
    pub file_name: &'static str,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Atm,
        Category::Logo,
        Category::Wording,
        Category::Format,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Category::Atm => "atm",
            Category::Logo => "logo",
            Category::Wording => "wording",
            Category::Format => "format",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Category::Atm => "ATM画像チェック",
            Category::Logo => "ロゴチェック",
            Category::Wording => "表記・ワーディングチェック",
            Category::Format => "形式チェック",
        }
    }

    /// Position in canonical order.
    pub fn position(self) -> usize {
        Category::ALL
            .iter()
            .position(|candidate| *candidate == self)
            .unwrap_or(usize::MAX)
    }

    pub fn parse(id: &str) -> Option<Category> {
        let normalized = id.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|category| category.id() == normalized)
    }

    /// Reference images required by this category, in send order. Wording
    /// and format checks run on textual rules alone.
    pub fn references(self) -> &'static [ReferenceSpec] {
        match self {
            Category::Atm => &[
                ReferenceSpec {
                    caption: "参照画像1（ATM画像の種類ルール）：",
                    file_name: "atm_image_types.png",
                },
                ReferenceSpec {
                    caption: "参照画像2（ATM画像の禁則事項）：",
                    file_name: "atm_image_prohibitions.png",
                },
            ],
            Category::Logo => &[
                ReferenceSpec {
                    caption: "参照画像1（ロゴの形・色の規定）：",
                    file_name: "logo_guide.png",
                },
                ReferenceSpec {
                    caption: "参照画像2（ロゴのアイソレーション・最小サイズ規定）：",
                    file_name: "logo_isolation_minsize.png",
                },
            ],
            Category::Wording | Category::Format => &[],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Sorts outcomes or sections that expose a category into canonical order.
pub fn sort_canonical<T, F>(items: &mut [T], category_of: F)
where
    F: Fn(&T) -> Category,
{
    items.sort_by_key(|item| category_of(item).position());
}
