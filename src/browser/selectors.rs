//! Site surface: URLs, CSS selectors, and page hooks.
//!
//! Everything the engine knows about the target site's DOM lives here so a
//! site change is a one-file fix.

pub const DEFAULT_LOGIN_URL: &str =
    "https://extapps.jdpowervalues.com/ValuesOnline/Home/LicenseAgreement?ReturnUrl=/ValuesOnline/";
pub const DEFAULT_INVENTORY_URL: &str =
    "https://extapps.jdpowervalues.com/ValuesOnline/Inventory";

// Login page
pub const USERNAME_INPUT: &str = "#usernameInput";
pub const PASSWORD_INPUT: &str = "#passwordInput";
pub const LOGIN_BUTTON: &str = "#loginButton";

// License-acceptance interstitial (not always shown)
pub const LICENSE_CHECKBOX: &str = "#agreementCheckBox";

// Inventory grid
pub const STOCK_NUMBER_INPUT: &str = "#StockNumberInput";
pub const BOOK_ICON: &str = "img[title='Bookout'][src*='book.png']";
pub const CLEAR_FILTERS_BUTTON: &str = "a.dxgvFilterBarLink[onclick*='ClearFilter']";
pub const CREATE_FILTER_BUTTON: &str = "a.dxgvFilterBarLink[onclick*='ShowFilterControl']";

/// JS hook the grid uses to apply a column filter after input changes.
pub const FILTER_CHANGED_HOOK: &str = "vehicleGridViewFilterChanged('StockNumber')";
/// JS click on the book icon's parent anchor; the grid swallows synthetic
/// clicks on the anchor itself.
pub const BOOK_ICON_JS_CLICK: &str =
    "document.querySelector(\"img[title='Bookout']\").parentElement.click()";

// CSV export menu
pub const EXPORT_MENU_BUTTON: &str = "#primaryMenu_DXI4_T";
pub const EXPORT_ALL_COLUMNS: &str = "#primaryMenu_DXI4i1_T";
pub const EXPORT_TO_CSV: &str = "#primaryMenu_DXI4i1i2_";

// Vehicle detail view
pub const PRINT_REPORTS_BUTTON: &str = "button.reportButton:not(.requiresVehicle)";
pub const CREATE_PDF_BUTTON: &str = "#createPdfButton";

// Logout
pub const LOGOUT_BUTTON: &str = "#btnLogout";

/// Substring identifying report-viewer popup tabs by URL.
pub const REPORT_PATH_MARKER: &str = "GetPdfReport";

/// Substring identifying the login page by URL (session-lost detection).
pub const LOGIN_PATH_MARKER: &str = "LicenseAgreement";

/// URL patterns aborted when resource blocking is enabled.
pub const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.css", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3",
];
